use owo_colors::{OwoColorize, Style, Styled};
use supports_color::Stream::Stderr;

use crate::media::UsmMedia;
use crate::page::Element;

pub trait ErrStyle {
    fn errstyle(&self, style: Style) -> Styled<&Self>;
}

impl<D> ErrStyle for D {
    fn errstyle(&self, style: Style) -> Styled<&Self> {
        self.style(get_errstyle(style))
    }
}

pub fn get_errstyle(style: Style) -> Style {
    supports_color::on(Stderr)
        .filter(|f| f.has_basic)
        .map_or_else(Style::new, |_| style)
}

pub fn format_channel_for_console<M: UsmMedia + ?Sized>(tag: &str, media: &M) -> String {
    let crid = media.crid_page();
    format!(
        "{} ch {} ({}), {} bps, {} bytes",
        tag.errstyle(Style::new().green()),
        media.channel_number().errstyle(Style::new().yellow()),
        crid.get("filename")
            .and_then(Element::as_str)
            .unwrap_or("<unnamed>"),
        crid.get_int("avbps").unwrap_or(0).errstyle(Style::new().yellow()),
        crid.get_int("filesize")
            .unwrap_or(0)
            .errstyle(Style::new().yellow()),
    )
}
