//! Landing page: static markup from `static/` with the sender and share
//! filled in.

use std::fmt::{self, Write};

const INDEX_HTML: &str = include_str!("static/index.html");

/// Served when the real page cannot be built
pub const ERROR_PAGE: &str = include_str!("static/error.html");

/// What the page knows about the current share
#[derive(Debug, Clone, PartialEq)]
pub enum ShareView {
    Nothing,
    Missing { file_name: String },
    Ready { file_name: String, size: u64 },
}

/// Who is sharing
#[derive(Debug, Clone)]
pub struct SenderView<'a> {
    pub nickname: &'a str,
    pub accent_color: &'a str,
    pub has_avatar: bool,
}

/// "#AARRGGBB" or "#RRGGBB" to (hex, r, g, b); grey for anything else
fn parse_accent(color: &str) -> (String, u8, u8, u8) {
    let hex = color.trim_start_matches('#');
    let hex = if hex.len() == 8 {
        hex.get(2..).unwrap_or(hex)
    } else {
        hex
    };
    let channel = |i: usize| hex.get(i..i + 2).and_then(|c| u8::from_str_radix(c, 16).ok());
    match (hex.len(), channel(0), channel(2), channel(4)) {
        (6, Some(r), Some(g), Some(b)) => (hex.to_ascii_uppercase(), r, g, b),
        _ => ("808080".to_string(), 128, 128, 128),
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Copy `template`, swapping each `{{KEY}}` for `value(KEY)` in one pass.
///
/// Unknown or unterminated placeholders fail the whole page.
fn fill<'a>(template: &str, value: impl Fn(&str) -> Option<&'a str>) -> Result<String, fmt::Error> {
    let mut out = String::with_capacity(template.len() + 512);
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after.find("}}").ok_or(fmt::Error)?;
        out.push_str(value(&after[..close]).ok_or(fmt::Error)?);
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

pub fn render_index(sender: &SenderView<'_>, share: &ShareView) -> Result<String, fmt::Error> {
    let (hex, r, g, b) = parse_accent(sender.accent_color);
    let rgb = format!("{r}, {g}, {b}");
    let nickname = escape_html(sender.nickname);
    let avatar = if sender.has_avatar {
        r#"<img src="/avatar" alt="">"#.to_string()
    } else {
        sender
            .nickname
            .chars()
            .next()
            .map(|c| escape_html(&c.to_uppercase().to_string()))
            .unwrap_or_default()
    };

    let mut file_box = String::new();
    match share {
        ShareView::Ready { file_name, size } => write!(
            file_box,
            r#"<div class="file-box"><b>{}</b><br><span style="font-size:12px; opacity:0.7">{:.2} MB</span></div>
<a href="/download" class="btn">Download</a>"#,
            escape_html(file_name),
            *size as f64 / 1024.0 / 1024.0
        )?,
        ShareView::Missing { file_name } => write!(
            file_box,
            r#"<div class="file-box">{} (not found)</div>"#,
            escape_html(file_name)
        )?,
        ShareView::Nothing => file_box.push_str(r#"<div class="file-box">No file</div>"#),
    }

    fill(INDEX_HTML, |key| match key {
        "ACCENT" => Some(hex.as_str()),
        "ACCENT_RGB" => Some(rgb.as_str()),
        "AVATAR" => Some(avatar.as_str()),
        "NICKNAME" => Some(nickname.as_str()),
        "SHARE" => Some(file_box.as_str()),
        _ => None,
    })
}
