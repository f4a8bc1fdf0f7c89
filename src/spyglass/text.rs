use serde::Serialize;

/// A Minecraft-formatted string in its three canonical renderings.
///
/// `raw` keeps the `§`-escapes exactly as received, `clean` strips them, and
/// `html` wraps each style run in a `<span>` using the fixed vanilla palette.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormattedText {
    pub raw: String,
    pub clean: String,
    pub html: String,
}

impl FormattedText {
    pub fn parse(raw: &str) -> Self {
        let mut clean = String::with_capacity(raw.len());
        let mut html = String::with_capacity(raw.len() + 16);

        let mut style = Style::default();
        let mut run = String::new();

        let mut chars = raw.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch == '\u{a7}' {
                let Some(code) = chars.next() else { break };
                let code = code.to_ascii_lowercase();
                let next = match code {
                    '0'..='9' | 'a'..='f' => Style {
                        color: Some(code),
                        ..Style::default()
                    },
                    'k' => Style {
                        obfuscated: true,
                        ..style
                    },
                    'l' => Style { bold: true, ..style },
                    'm' => Style {
                        strikethrough: true,
                        ..style
                    },
                    'n' => Style {
                        underline: true,
                        ..style
                    },
                    'o' => Style {
                        italic: true,
                        ..style
                    },
                    'r' => Style::default(),
                    // Unknown codes are dropped from clean output, style unchanged.
                    _ => style,
                };
                if next != style {
                    flush_run(&mut html, &style, &mut run);
                    style = next;
                }
                continue;
            }

            clean.push(ch);
            run.push(ch);
        }
        flush_run(&mut html, &style, &mut run);

        Self {
            raw: raw.to_string(),
            clean,
            html,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Style {
    color: Option<char>,
    bold: bool,
    italic: bool,
    underline: bool,
    strikethrough: bool,
    obfuscated: bool,
}

fn flush_run(html: &mut String, style: &Style, run: &mut String) {
    if run.is_empty() {
        return;
    }

    let mut css = String::new();
    if let Some(color) = style.color {
        css.push_str("color: #");
        css.push_str(palette_hex(color));
        css.push(';');
    }
    if style.bold {
        css.push_str("font-weight: bold;");
    }
    if style.italic {
        css.push_str("font-style: italic;");
    }
    if style.underline && style.strikethrough {
        css.push_str("text-decoration: underline line-through;");
    } else if style.underline {
        css.push_str("text-decoration: underline;");
    } else if style.strikethrough {
        css.push_str("text-decoration: line-through;");
    }

    if css.is_empty() {
        html.push_str("<span>");
    } else {
        html.push_str("<span style=\"");
        html.push_str(&css);
        html.push_str("\">");
    }
    for ch in run.chars() {
        match ch {
            '&' => html.push_str("&amp;"),
            '<' => html.push_str("&lt;"),
            '>' => html.push_str("&gt;"),
            '"' => html.push_str("&quot;"),
            '\n' => html.push_str("<br>"),
            other => html.push(other),
        }
    }
    html.push_str("</span>");
    run.clear();
}

/// Vanilla chat palette, `§0`..`§f`.
fn palette_hex(code: char) -> &'static str {
    match code {
        '0' => "000000",
        '1' => "0000AA",
        '2' => "00AA00",
        '3' => "00AAAA",
        '4' => "AA0000",
        '5' => "AA00AA",
        '6' => "FFAA00",
        '7' => "AAAAAA",
        '8' => "555555",
        '9' => "5555FF",
        'a' => "55FF55",
        'b' => "55FFFF",
        'c' => "FF5555",
        'd' => "FF55FF",
        'e' => "FFFF55",
        _ => "FFFFFF",
    }
}

/// Map a named chat-component color (or `#rrggbb`) back to its legacy code.
/// Unknown names fall through to white.
pub fn color_code_for_name(name: &str) -> char {
    match name {
        "black" => '0',
        "dark_blue" => '1',
        "dark_green" => '2',
        "dark_aqua" => '3',
        "dark_red" => '4',
        "dark_purple" => '5',
        "gold" => '6',
        "gray" => '7',
        "dark_gray" => '8',
        "blue" => '9',
        "green" => 'a',
        "aqua" => 'b',
        "red" => 'c',
        "light_purple" => 'd',
        "yellow" => 'e',
        _ => 'f',
    }
}
