//! Vendor ASCII log parsing.
//!
//! Full form: `#BESTPOSA,COM1,0,55.0,FINESTEERING,...;SOL_COMPUTED,SINGLE,...*1b2d3c4e`
//!
//! The bare form used by some firmware omits the `#` and the header
//! section: `BESTPOSA,SOL_COMPUTED,SINGLE,...`.

use super::crc::crc32_block;
use super::split_fields;
use crate::error::ParseError;

/// A parsed vendor ASCII log line
#[derive(Debug, Clone, PartialEq)]
pub struct AsciiMessage {
    /// Leading tag token, upper case (e.g. "BESTPOSA")
    pub tag: String,
    /// Header fields after the tag (empty for the bare form)
    pub header: Vec<String>,
    /// Data fields
    pub fields: Vec<String>,
    /// `None` when the line carries no `*crc` trailer
    pub crc_ok: Option<bool>,
}

impl AsciiMessage {
    /// Schema key for the tag: the tag without its trailing `A`
    pub fn layout_key(&self) -> &str {
        self.tag.strip_suffix('A').unwrap_or(&self.tag)
    }
}

/// Whether a text line should be treated as a vendor ASCII log
pub fn is_ascii_log(line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with('#') || (!line.starts_with('$') && line.contains(','))
}

/// Parse a `#`-prefixed or bare vendor ASCII log line
pub fn parse_log(line: &str) -> Result<AsciiMessage, ParseError> {
    let line = line.trim();
    let unprefixed = line.strip_prefix('#').unwrap_or(line);

    let (content, crc_ok) = match unprefixed.rsplit_once('*') {
        Some((content, sum)) if sum.len() == 8 => {
            let ok = u32::from_str_radix(sum, 16)
                .map(|expected| expected == crc32_block(content.as_bytes()))
                .unwrap_or(false);
            (content, Some(ok))
        }
        _ => (unprefixed, None),
    };

    let (header_part, data_part) = match content.split_once(';') {
        Some((header, data)) => (header, Some(data)),
        None => (content, None),
    };

    let mut header = split_fields(header_part);
    if header.is_empty() || header[0].is_empty() {
        return Err(ParseError::MalformedSentence(line.to_string()));
    }
    let tag = header.remove(0).to_ascii_uppercase();

    let (header, fields) = match data_part {
        Some(data) => (header, split_fields(data)),
        // Bare tag: everything after the tag is data
        None => (Vec::new(), header),
    };

    Ok(AsciiMessage {
        tag,
        header,
        fields,
        crc_ok,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_crc(content: &str) -> String {
        format!("#{}*{:08x}", content, crc32_block(content.as_bytes()))
    }

    #[test]
    fn test_parse_full_log() {
        let line = with_crc("BESTPOSA,COM1,0,55.0,FINESTEERING;SOL_COMPUTED,SINGLE,51.1,-114.0");
        let msg = parse_log(&line).unwrap();
        assert_eq!(msg.tag, "BESTPOSA");
        assert_eq!(msg.layout_key(), "BESTPOS");
        assert_eq!(msg.header, vec!["COM1", "0", "55.0", "FINESTEERING"]);
        assert_eq!(msg.fields, vec!["SOL_COMPUTED", "SINGLE", "51.1", "-114.0"]);
        assert_eq!(msg.crc_ok, Some(true));
    }

    #[test]
    fn test_parse_detects_bad_crc() {
        let line = "#BESTPOSA,COM1;SOL_COMPUTED*00000000";
        assert_eq!(parse_log(line).unwrap().crc_ok, Some(false));
    }

    #[test]
    fn test_parse_bare_tag() {
        let msg = parse_log("HEADINGA,SOL_COMPUTED,NARROW_INT,1.5").unwrap();
        assert_eq!(msg.tag, "HEADINGA");
        assert!(msg.header.is_empty());
        assert_eq!(msg.fields, vec!["SOL_COMPUTED", "NARROW_INT", "1.5"]);
        assert_eq!(msg.crc_ok, None);
    }

    #[test]
    fn test_is_ascii_log() {
        assert!(is_ascii_log("#TIMEA,COM1;VALID"));
        assert!(is_ascii_log("HEADINGA,1,2"));
        assert!(!is_ascii_log("$GPGGA,1,2"));
        assert!(!is_ascii_log("<OK"));
    }

    #[test]
    fn test_parse_empty_tag() {
        assert!(parse_log("#;1,2").is_err());
    }
}
