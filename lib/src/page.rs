//! CRI `@UTF` key/value tables. A table is a sequence of homogeneous
//! pages; directory, header, and seek-index payloads are all carried
//! this way.

use std::io::Cursor;

use binrw::{binrw, BinReaderExt, BinWriterExt};
use encoding_rs::Encoding;
use indexmap::IndexMap;

use crate::error::UsmError;
use crate::tools::slugify;

pub const CRIUSF_DIR_STREAM: &str = "CRIUSF_DIR_STREAM";
pub const VIDEO_HDRINFO: &str = "VIDEO_HDRINFO";
pub const AUDIO_HDRINFO: &str = "AUDIO_HDRINFO";
pub const VIDEO_SEEKINFO: &str = "VIDEO_SEEKINFO";

const RECURRING: u8 = 1;
const NON_RECURRING: u8 = 2;

/// A typed leaf value inside a page.
///
/// Integers are big-endian on the wire; floats are little-endian.
/// Strings live in the table's string pool, blobs in its byte pool.
#[derive(Debug, Clone)]
pub enum Element {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        use Element::*;
        match (self, other) {
            (I8(a), I8(b)) => a == b,
            (U8(a), U8(b)) => a == b,
            (I16(a), I16(b)) => a == b,
            (U16(a), U16(b)) => a == b,
            (I32(a), I32(b)) => a == b,
            (U32(a), U32(b)) => a == b,
            (I64(a), I64(b)) => a == b,
            (U64(a), U64(b)) => a == b,
            // Bit equality keeps recurring-column classification
            // deterministic in the presence of NaN.
            (F32(a), F32(b)) => a.to_bits() == b.to_bits(),
            (F64(a), F64(b)) => a.to_bits() == b.to_bits(),
            (String(a), String(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Element {}

impl Element {
    pub fn type_tag(&self) -> u8 {
        match self {
            Element::I8(_) => 0x10,
            Element::U8(_) => 0x11,
            Element::I16(_) => 0x12,
            Element::U16(_) => 0x13,
            Element::I32(_) => 0x14,
            Element::U32(_) => 0x15,
            Element::I64(_) => 0x16,
            Element::U64(_) => 0x17,
            Element::F32(_) => 0x18,
            Element::F64(_) => 0x19,
            Element::String(_) => 0x1A,
            Element::Bytes(_) => 0x1B,
        }
    }

    /// Widen any of the integer variants to an i64.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Element::I8(v) => Some(i64::from(*v)),
            Element::U8(v) => Some(i64::from(*v)),
            Element::I16(v) => Some(i64::from(*v)),
            Element::U16(v) => Some(i64::from(*v)),
            Element::I32(v) => Some(i64::from(*v)),
            Element::U32(v) => Some(i64::from(*v)),
            Element::I64(v) => Some(*v),
            Element::U64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Element::String(v) => Some(v),
            _ => None,
        }
    }
}

/// One row of a `@UTF` table: a named, ordered mapping from column name
/// to [Element]. Insertion order defines the on-disk column order.
#[derive(Debug, Clone, PartialEq)]
pub struct UsmPage {
    name: String,
    elements: IndexMap<String, Element>,
}

impl UsmPage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            elements: IndexMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert or replace an element. Windows-style separators in
    /// `filename` values are normalized to `/`.
    pub fn update(&mut self, name: impl Into<String>, element: Element) {
        let name = name.into();
        let element = match element {
            Element::String(v) if name == "filename" => Element::String(v.replace('\\', "/")),
            other => other,
        };
        self.elements.insert(name, element);
    }

    pub fn get(&self, name: &str) -> Option<&Element> {
        self.elements.get(name)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.elements.get(name).and_then(Element::as_int)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Element)> {
        self.elements.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.elements.keys().map(String::as_str)
    }

    pub fn num_elements(&self) -> usize {
        self.elements.len()
    }

    /// The slugified base name stored in this page's `filename` element.
    /// Strips any leading path components first.
    pub fn filename(&self) -> Result<String, UsmError> {
        let filename = self.get("filename").ok_or_else(|| {
            UsmError::MissingDirectoryEntry(format!("Page {} has no filename", self.name))
        })?;
        let value = filename.as_str().ok_or_else(|| {
            UsmError::InvalidPageTable(format!("filename is not a string: {:?}", filename))
        })?;

        let base = value.rsplit('/').next().unwrap_or(value);
        Ok(slugify(base, true))
    }
}

#[binrw]
#[brw(big, magic = b"@UTF")]
struct TablePrelude {
    payload_size: u32,
    unique_array_offset: u32,
    strings_offset: u32,
    byte_array_offset: u32,
    page_name_offset: u32,
    num_elements_per_page: u16,
    unique_array_size_per_page: u16,
    num_pages: u32,
}

/// Byte cursor over one of the table's value arrays.
struct ValueArray<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ValueArray<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], UsmError> {
        let slice = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or_else(|| UsmError::InvalidPageTable("Value array too short".into()))?;
        self.pos += len;
        Ok(slice)
    }

    fn take_u32(&mut self) -> Result<u32, UsmError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }
}

fn pool_string(
    pool: &[u8],
    offset: usize,
    encoding: &'static Encoding,
) -> Result<String, UsmError> {
    let tail = pool
        .get(offset..)
        .ok_or_else(|| UsmError::InvalidPageTable("String offset out of range".into()))?;
    let end = tail
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| UsmError::InvalidPageTable("Unterminated string in pool".into()))?;
    Ok(encoding
        .decode_without_bom_handling(&tail[..end])
        .0
        .into_owned())
}

fn table_slice(info: &[u8], start: usize, end: usize) -> Result<&[u8], UsmError> {
    info.get(start..end)
        .ok_or_else(|| UsmError::InvalidPageTable("Payload shorter than its offsets claim".into()))
}

/// Decode a `@UTF` payload into its pages.
pub fn get_pages(info: &[u8], encoding: &'static Encoding) -> Result<Vec<UsmPage>, UsmError> {
    let prelude: TablePrelude = Cursor::new(info).read_be().map_err(|e| {
        if matches!(
            crate::error::binrw_root_cause(&e),
            binrw::Error::BadMagic { .. }
        ) {
            UsmError::InvalidPageTable(format!(
                "Invalid table signature: {:02x?}",
                &info[..info.len().min(4)]
            ))
        } else {
            UsmError::BinRW("Couldn't read table prelude".into(), e)
        }
    })?;

    // All offsets are relative to the end of the 8 byte magic+size header.
    let payload_end = 8 + prelude.payload_size as usize;
    let string_array = table_slice(
        info,
        8 + prelude.strings_offset as usize,
        8 + prelude.byte_array_offset as usize,
    )?;
    let byte_array = table_slice(info, 8 + prelude.byte_array_offset as usize, payload_end)?;
    let schema_array = table_slice(info, 0x20, 8 + prelude.unique_array_offset as usize)?;
    let unique_bytes = table_slice(
        info,
        8 + prelude.unique_array_offset as usize,
        8 + prelude.unique_array_offset as usize
            + prelude.unique_array_size_per_page as usize * prelude.num_pages as usize,
    )?;

    let page_name = pool_string(
        string_array,
        prelude.page_name_offset as usize,
        encoding_rs::UTF_8,
    )?;

    log::debug!(
        "get_pages: name: {}, payload size: {}, unique array offset: {:x}, \
         string array offset: {:x}, byte array offset: {:x}, \
         element count per page: {}, unique size per page: {:x}, page count: {}",
        page_name,
        prelude.payload_size,
        prelude.unique_array_offset,
        prelude.strings_offset,
        prelude.byte_array_offset,
        prelude.num_elements_per_page,
        prelude.unique_array_size_per_page,
        prelude.num_pages,
    );

    let mut unique_array = ValueArray::new(unique_bytes);
    let mut pages = Vec::with_capacity(prelude.num_pages as usize);
    for _ in 0..prelude.num_pages {
        let mut page = UsmPage::new(page_name.clone());
        // The schema repeats for every page; recurring values are re-read
        // from the same spot, unique values advance through the array.
        let mut schema = ValueArray::new(schema_array);
        for _ in 0..prelude.num_elements_per_page {
            let descriptor = schema.take(1)?[0];
            let type_tag = descriptor & 0x1F;
            let occurrence = descriptor >> 5;

            let name_offset = schema.take_u32()?;
            let element_name = pool_string(string_array, name_offset as usize, encoding)?;

            let current = match occurrence {
                RECURRING => &mut schema,
                NON_RECURRING => &mut unique_array,
                other => {
                    return Err(UsmError::InvalidPageTable(format!(
                        "Unknown occurrence {} for element {}",
                        other, element_name
                    )))
                }
            };

            let element = read_element(type_tag, current, string_array, byte_array, encoding)
                .map_err(|e| e.add_context(format!("Couldn't read element {}", element_name)))?;
            page.update(element_name, element);
        }

        pages.push(page);
    }

    Ok(pages)
}

fn read_element(
    type_tag: u8,
    array: &mut ValueArray,
    string_array: &[u8],
    byte_array: &[u8],
    encoding: &'static Encoding,
) -> Result<Element, UsmError> {
    Ok(match type_tag {
        0x10 => Element::I8(array.take(1)?[0] as i8),
        0x11 => Element::U8(array.take(1)?[0]),
        0x12 => Element::I16(i16::from_be_bytes(array.take(2)?.try_into().unwrap())),
        0x13 => Element::U16(u16::from_be_bytes(array.take(2)?.try_into().unwrap())),
        0x14 => Element::I32(i32::from_be_bytes(array.take(4)?.try_into().unwrap())),
        0x15 => Element::U32(array.take_u32()?),
        0x16 => Element::I64(i64::from_be_bytes(array.take(8)?.try_into().unwrap())),
        0x17 => Element::U64(u64::from_be_bytes(array.take(8)?.try_into().unwrap())),
        // Floats are the wire format's one little-endian exception.
        0x18 => Element::F32(f32::from_le_bytes(array.take(4)?.try_into().unwrap())),
        0x19 => Element::F64(f64::from_le_bytes(array.take(8)?.try_into().unwrap())),
        0x1A => {
            let offset = array.take_u32()?;
            Element::String(pool_string(string_array, offset as usize, encoding)?)
        }
        0x1B => {
            let start = array.take_u32()? as usize;
            let end = array.take_u32()? as usize;
            let blob = byte_array
                .get(start..end)
                .ok_or_else(|| UsmError::InvalidPageTable("Byte pool range out of bounds".into()))?;
            Element::Bytes(blob.to_vec())
        }
        other => {
            return Err(UsmError::InvalidPageTable(format!(
                "Unknown element type: {:#04x}",
                other
            )))
        }
    })
}

/// Encode pages into a `@UTF` payload. All pages must share a name and
/// the same columns in the same order. Columns whose value repeats on
/// every page of a multi-page table are stored once in the schema.
pub fn pack_pages(
    pages: &[UsmPage],
    encoding: &'static Encoding,
    string_padding: usize,
) -> Result<Vec<u8>, UsmError> {
    let first = pages
        .first()
        .ok_or_else(|| UsmError::InvalidPageTable("No pages given".into()))?;

    let keys: Vec<&str> = first.keys().collect();
    for page in pages {
        if page.name() != first.name() {
            return Err(UsmError::InvalidPageTable(
                "Pages don't have the same names".into(),
            ));
        }
        if !page.keys().eq(keys.iter().copied()) {
            return Err(UsmError::InvalidPageTable(
                "Pages don't have the same keys".into(),
            ));
        }
    }

    // The pool always leads with "<NULL>", then the page name, then the
    // column names in order. String values are appended as they are
    // emitted.
    let mut string_array: Vec<u8> = Vec::new();
    string_array.extend_from_slice(b"<NULL>\0");
    let page_name_offset = string_array.len();
    string_array.extend_from_slice(first.name().as_bytes());
    string_array.push(0);

    let mut name_offsets = Vec::with_capacity(keys.len());
    for key in &keys {
        name_offsets.push(string_array.len() as u32);
        string_array.extend_from_slice(key.as_bytes());
        string_array.push(0);
    }

    let recurring: Vec<bool> = keys
        .iter()
        .map(|key| {
            pages.len() > 1
                && pages
                    .iter()
                    .all(|page| page.get(key) == first.get(key))
        })
        .collect();

    let mut shared_array: Vec<u8> = Vec::new();
    let mut unique_array: Vec<u8> = Vec::new();
    let mut byte_array: Vec<u8> = Vec::new();
    for (i, page) in pages.iter().enumerate() {
        for (column, (key, element)) in page.iter().enumerate() {
            let current = if recurring[column] {
                // Descriptor and value are both emitted exactly once.
                if i != 0 {
                    continue;
                }
                shared_array.push((RECURRING << 5) | element.type_tag());
                shared_array.extend_from_slice(&name_offsets[column].to_be_bytes());
                &mut shared_array
            } else {
                if i == 0 {
                    shared_array.push((NON_RECURRING << 5) | element.type_tag());
                    shared_array.extend_from_slice(&name_offsets[column].to_be_bytes());
                }
                &mut unique_array
            };

            write_element(element, current, &mut string_array, &mut byte_array, encoding)
                .map_err(|e| e.add_context(format!("Couldn't pack element {}", key)))?;
        }
    }

    string_array.extend(std::iter::repeat(0u8).take(string_padding));

    let data_size = 24 + shared_array.len() + unique_array.len() + string_array.len() + byte_array.len();
    let prelude = TablePrelude {
        payload_size: data_size as u32,
        unique_array_offset: (24 + shared_array.len()) as u32,
        strings_offset: (24 + shared_array.len() + unique_array.len()) as u32,
        byte_array_offset: (24 + shared_array.len() + unique_array.len() + string_array.len())
            as u32,
        page_name_offset: page_name_offset as u32,
        num_elements_per_page: keys.len() as u16,
        unique_array_size_per_page: (unique_array.len() / pages.len()) as u16,
        num_pages: pages.len() as u32,
    };

    let mut result = Cursor::new(Vec::with_capacity(8 + data_size));
    result
        .write_be(&prelude)
        .map_err(|e| UsmError::BinRW("Couldn't write table prelude".into(), e))?;
    let mut result = result.into_inner();
    result.extend_from_slice(&shared_array);
    result.extend_from_slice(&unique_array);
    result.extend_from_slice(&string_array);
    result.extend_from_slice(&byte_array);
    Ok(result)
}

fn write_element(
    element: &Element,
    current: &mut Vec<u8>,
    string_array: &mut Vec<u8>,
    byte_array: &mut Vec<u8>,
    encoding: &'static Encoding,
) -> Result<(), UsmError> {
    match element {
        Element::I8(v) => current.extend_from_slice(&v.to_be_bytes()),
        Element::U8(v) => current.extend_from_slice(&v.to_be_bytes()),
        Element::I16(v) => current.extend_from_slice(&v.to_be_bytes()),
        Element::U16(v) => current.extend_from_slice(&v.to_be_bytes()),
        Element::I32(v) => current.extend_from_slice(&v.to_be_bytes()),
        Element::U32(v) => current.extend_from_slice(&v.to_be_bytes()),
        Element::I64(v) => current.extend_from_slice(&v.to_be_bytes()),
        Element::U64(v) => current.extend_from_slice(&v.to_be_bytes()),
        Element::F32(v) => current.extend_from_slice(&v.to_le_bytes()),
        Element::F64(v) => current.extend_from_slice(&v.to_le_bytes()),
        Element::String(v) => {
            let value_offset = string_array.len() as u32;
            let (encoded, _, had_errors) = encoding.encode(v);
            if had_errors {
                return Err(UsmError::InvalidPageTable(format!(
                    "String '{}' is not representable in {}",
                    v,
                    encoding.name()
                )));
            }
            string_array.extend_from_slice(&encoded);
            string_array.push(0);
            current.extend_from_slice(&value_offset.to_be_bytes());
        }
        Element::Bytes(v) => {
            let start = byte_array.len() as u32;
            let end = start + v.len() as u32;
            current.extend_from_slice(&start.to_be_bytes());
            current.extend_from_slice(&end.to_be_bytes());
            byte_array.extend_from_slice(v);
        }
    }

    Ok(())
}

/// Pull the keyframe frame ids out of a channel's `VIDEO_SEEKINFO` pages.
pub fn keyframes_from_seek_pages(seek_pages: &[UsmPage]) -> Result<Vec<u32>, UsmError> {
    let mut result = Vec::with_capacity(seek_pages.len());
    for seek in seek_pages {
        if seek.name() != VIDEO_SEEKINFO {
            return Err(UsmError::InvalidPageTable(format!(
                "Page name is not '{}': {}",
                VIDEO_SEEKINFO,
                seek.name()
            )));
        }

        let frame_id = seek.get_int("ofs_frmid").ok_or_else(|| {
            UsmError::InvalidPageTable("Seek page has no ofs_frmid".into())
        })?;
        result.push(frame_id as u32);
    }

    Ok(result)
}

#[cfg(test)]
mod page_tests {
    use super::*;
    use encoding_rs::{SHIFT_JIS, UTF_8};

    fn single_page() -> UsmPage {
        let mut page = UsmPage::new("T");
        page.update("a", Element::I32(1));
        page.update("b", Element::String("x".into()));
        page
    }

    #[test]
    fn single_page_round_trip() {
        let page = single_page();
        let packed = pack_pages(&[page.clone()], UTF_8, 0).unwrap();

        assert_eq!(&packed[..4], b"@UTF");
        // num_elements_per_page and num_pages in the prelude.
        assert_eq!(u16::from_be_bytes(packed[24..26].try_into().unwrap()), 2);
        assert_eq!(u32::from_be_bytes(packed[28..32].try_into().unwrap()), 1);

        let decoded = get_pages(&packed, UTF_8).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0], page);
    }

    #[test]
    fn single_page_is_all_unique() {
        let packed = pack_pages(&[single_page()], UTF_8, 0).unwrap();
        // First descriptor byte sits right after the 0x20 byte prelude.
        assert_eq!(packed[0x20] >> 5, NON_RECURRING);
    }

    #[test]
    fn recurring_columns_packed_once() {
        let mut pages = Vec::new();
        for i in 0..3i64 {
            let mut page = UsmPage::new("SEEK");
            page.update("ofs_byte", Element::I64(i * 0x100));
            page.update("num_skip", Element::U16(0));
            pages.push(page);
        }

        let packed = pack_pages(&pages, UTF_8, 0).unwrap();
        let decoded = get_pages(&packed, UTF_8).unwrap();
        assert_eq!(decoded, pages);

        // num_skip recurs, so the per-page unique array holds only the
        // 8 byte ofs_byte.
        assert_eq!(u16::from_be_bytes(packed[26..28].try_into().unwrap()), 8);
    }

    #[test]
    fn all_value_types_round_trip() {
        let mut page = UsmPage::new("EVERYTHING");
        page.update("i8", Element::I8(-1));
        page.update("u8", Element::U8(0xFE));
        page.update("i16", Element::I16(-2));
        page.update("u16", Element::U16(0xFFFE));
        page.update("i32", Element::I32(-3));
        page.update("u32", Element::U32(0xFFFF_FFFE));
        page.update("i64", Element::I64(-4));
        page.update("u64", Element::U64(4));
        page.update("f32", Element::F32(0.5));
        page.update("f64", Element::F64(-0.25));
        page.update("s", Element::String("hello".into()));
        page.update("blob", Element::Bytes(vec![1, 2, 3, 4]));

        let packed = pack_pages(&[page.clone()], UTF_8, 0).unwrap();
        let decoded = get_pages(&packed, UTF_8).unwrap();
        assert_eq!(decoded, vec![page]);
    }

    #[test]
    fn shift_jis_string_values() {
        let mut page = UsmPage::new(CRIUSF_DIR_STREAM);
        page.update("filename", Element::String("ムービー.usm".into()));

        let packed = pack_pages(&[page.clone()], SHIFT_JIS, 0).unwrap();
        let decoded = get_pages(&packed, SHIFT_JIS).unwrap();
        assert_eq!(decoded[0].get("filename"), page.get("filename"));
    }

    #[test]
    fn filename_is_slugified() {
        let mut page = UsmPage::new(CRIUSF_DIR_STREAM);
        page.update(
            "filename",
            Element::String("I:\\Some Dir\\My Movie.usm".into()),
        );
        assert_eq!(page.filename().unwrap(), "my-movie.usm");
    }

    #[test]
    fn bad_magic_rejected() {
        let result = get_pages(b"@UTGxxxxxxxx", UTF_8);
        assert!(matches!(result, Err(UsmError::InvalidPageTable(_))));
    }

    #[test]
    fn mismatched_keys_rejected() {
        let mut other = UsmPage::new("T");
        other.update("c", Element::I32(1));
        other.update("b", Element::String("x".into()));
        let result = pack_pages(&[single_page(), other], UTF_8, 0);
        assert!(matches!(result, Err(UsmError::InvalidPageTable(_))));
    }

    #[test]
    fn seek_page_keyframes() {
        let mut seek = UsmPage::new(VIDEO_SEEKINFO);
        seek.update("ofs_byte", Element::I64(0x900));
        seek.update("ofs_frmid", Element::U32(30));
        seek.update("num_skip", Element::U16(0));
        seek.update("resv", Element::U16(0));
        assert_eq!(keyframes_from_seek_pages(&[seek]).unwrap(), vec![30]);

        let wrong = UsmPage::new("NOT_SEEKINFO");
        assert!(keyframes_from_seek_pages(&[wrong]).is_err());
    }
}
