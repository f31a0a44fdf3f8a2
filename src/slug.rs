//! Filesystem-safe names for converted files.
//!
//! The derivation is a pure function of `(title, video id)`, so converting the
//! same video twice always lands on the same file name.

const MAX_SLUG_LEN: usize = 100;
const FALLBACK_SLUG: &str = "audio";
const FALLBACK_ID: &str = "unknown";

/// Lowercase ASCII slug with `-` as the only separator.
///
/// Accented Latin letters are folded to their ASCII base, every other run of
/// characters outside `[a-z0-9]` collapses into one `-`, and the result never
/// starts or ends with `-`. An input with nothing usable yields `"audio"`.
pub fn slugify(text: &str) -> String {
    let mut out = String::with_capacity(text.len().min(MAX_SLUG_LEN));
    let mut pending_separator = false;

    for c in text.chars() {
        let folded = fold_char(c);
        let mut produced = false;
        for ascii in folded.chars() {
            let lower = ascii.to_ascii_lowercase();
            if lower.is_ascii_alphanumeric() {
                if pending_separator && !out.is_empty() {
                    out.push('-');
                }
                pending_separator = false;
                out.push(lower);
                produced = true;
            }
        }
        if !produced {
            pending_separator = true;
        }
    }

    if out.len() > MAX_SLUG_LEN {
        out.truncate(MAX_SLUG_LEN);
        while out.ends_with('-') {
            out.pop();
        }
    }

    if out.is_empty() {
        FALLBACK_SLUG.to_string()
    } else {
        out
    }
}

/// `slug(title)-id.mp3`. The id keeps its case (YouTube ids are case
/// sensitive) but is reduced to `[A-Za-z0-9_-]`.
pub fn output_file_name(title: &str, video_id: &str) -> String {
    let id: String = video_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    let id = id.trim_matches('-');
    let id = if id.is_empty() { FALLBACK_ID } else { id };
    format!("{}-{}.mp3", slugify(title), id)
}

/// File stem handed to the downloader; the tool appends the extension.
pub fn file_stem(file_name: &str) -> &str {
    file_name.strip_suffix(".mp3").unwrap_or(file_name)
}

fn fold_char(c: char) -> &'static str {
    match c {
        'a'..='z' | 'A'..='Z' | '0'..='9' => ascii_str(c),
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => "a",
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' | 'Ā' | 'Ă' | 'Ą' => "a",
        'æ' | 'Æ' => "ae",
        'ç' | 'ć' | 'č' | 'Ç' | 'Ć' | 'Č' => "c",
        'ď' | 'đ' | 'Ď' | 'Đ' | 'ð' | 'Ð' => "d",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => "e",
        'È' | 'É' | 'Ê' | 'Ë' | 'Ē' | 'Ė' | 'Ę' | 'Ě' => "e",
        'ğ' | 'Ğ' => "g",
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' | 'ı' => "i",
        'Ì' | 'Í' | 'Î' | 'Ï' | 'Ī' | 'Į' | 'İ' => "i",
        'ł' | 'Ł' | 'ľ' | 'Ľ' => "l",
        'ñ' | 'ń' | 'ň' | 'Ñ' | 'Ń' | 'Ň' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' | 'Ō' | 'Ő' => "o",
        'œ' | 'Œ' => "oe",
        'ř' | 'Ř' => "r",
        'ś' | 'š' | 'ş' | 'Ś' | 'Š' | 'Ş' => "s",
        'ß' => "ss",
        'ť' | 'ţ' | 'Ť' | 'Ţ' => "t",
        'þ' | 'Þ' => "th",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' | 'ų' => "u",
        'Ù' | 'Ú' | 'Û' | 'Ü' | 'Ū' | 'Ů' | 'Ű' | 'Ų' => "u",
        'ý' | 'ÿ' | 'Ý' | 'Ÿ' => "y",
        'ź' | 'ż' | 'ž' | 'Ź' | 'Ż' | 'Ž' => "z",
        _ => "",
    }
}

fn ascii_str(c: char) -> &'static str {
    const TABLE: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    match TABLE.find(c) {
        Some(index) => &TABLE[index..index + 1],
        None => "",
    }
}
