use encoding_rs::{DecoderResult, EUC_JP, Encoding};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use crate::error::ExportError;

pub const DEFAULT_LEGACY_ENCODING: &str = "EUC-JP";

/// How bytes that are invalid under the legacy encoding are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidBytes {
    /// `\xNN` per undecodable byte.
    #[default]
    Escape,
    /// One U+FFFD per malformed sequence.
    Replace,
}

impl InvalidBytes {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Escape => "escape",
            Self::Replace => "replace",
        }
    }
}

/// Decoder for the legacy 8-bit content store: page bodies and the
/// hex-encoded filenames the store keeps them under.
#[derive(Debug, Clone, Copy)]
pub struct LegacyCodec {
    encoding: &'static Encoding,
    invalid_bytes: InvalidBytes,
}

impl Default for LegacyCodec {
    fn default() -> Self {
        Self::new(EUC_JP, InvalidBytes::default())
    }
}

impl LegacyCodec {
    pub fn new(encoding: &'static Encoding, invalid_bytes: InvalidBytes) -> Self {
        Self {
            encoding,
            invalid_bytes,
        }
    }

    /// Resolve an encoding from its WHATWG label (`EUC-JP`, `shift_jis`, ...).
    pub fn from_label(label: &str, invalid_bytes: InvalidBytes) -> Result<Self, ExportError> {
        let encoding = Encoding::for_label(label.trim().as_bytes())
            .ok_or_else(|| ExportError::UnknownEncoding(label.to_string()))?;
        Ok(Self::new(encoding, invalid_bytes))
    }

    pub fn encoding_name(&self) -> &'static str {
        self.encoding.name()
    }

    pub fn invalid_bytes(&self) -> InvalidBytes {
        self.invalid_bytes
    }

    /// Decode legacy bytes. Never fails: malformed sequences are replaced
    /// with a visible placeholder and decoding resumes after them.
    pub fn decode_text(&self, bytes: &[u8]) -> String {
        let mut decoder = self.encoding.new_decoder_without_bom_handling();
        let mut out = String::with_capacity(
            decoder
                .max_utf8_buffer_length_without_replacement(bytes.len())
                .unwrap_or(bytes.len().saturating_mul(3)),
        );
        let mut position = 0usize;

        loop {
            let (result, read) =
                decoder.decode_to_string_without_replacement(&bytes[position..], &mut out, true);
            position += read;
            match result {
                DecoderResult::InputEmpty => break,
                DecoderResult::OutputFull => {
                    let remaining = bytes.len() - position;
                    out.reserve(
                        decoder
                            .max_utf8_buffer_length_without_replacement(remaining)
                            .unwrap_or(remaining.saturating_mul(3))
                            .max(16),
                    );
                }
                DecoderResult::Malformed(bad, consumed_after) => {
                    let end = position.saturating_sub(usize::from(consumed_after));
                    let start = end.saturating_sub(usize::from(bad));
                    self.push_placeholder(&mut out, &bytes[start..end]);
                }
            }
        }

        out
    }

    fn push_placeholder(&self, out: &mut String, malformed: &[u8]) {
        match self.invalid_bytes {
            InvalidBytes::Escape => {
                for byte in malformed {
                    out.push_str(&format!("\\x{byte:02x}"));
                }
            }
            InvalidBytes::Replace => out.push(char::REPLACEMENT_CHARACTER),
        }
    }

    /// Decode a stored basename (extension already stripped) back into the
    /// page title it encodes.
    pub fn decode_name(&self, stem: &str) -> String {
        let percent_encoded = to_percent_encoded(stem);
        let raw: Vec<u8> = percent_decode_str(&percent_encoded).collect();
        self.decode_text(&raw)
    }

    /// Inverse of [`decode_name`](Self::decode_name): the uppercase-hex
    /// basename the legacy store would use for `title`.
    pub fn encode_name(&self, title: &str) -> String {
        let (bytes, _, _) = self.encoding.encode(title);
        let mut output = String::with_capacity(bytes.len() * 2);
        for byte in bytes.iter() {
            output.push_str(&format!("{byte:02X}"));
        }
        output
    }

    /// Turn a raw archive entry path into a page path: directories and the
    /// extension are dropped, the basename is decoded and joined under
    /// `prefix`. The result never starts with `/`.
    pub fn normalize(&self, raw_path: &str, prefix: &str) -> String {
        let title = self.decode_name(file_stem(raw_path));
        let prefix = prefix.trim_matches('/');
        let joined = if prefix.is_empty() {
            title
        } else {
            format!("{prefix}/{title}")
        };
        joined.trim_start_matches('/').to_string()
    }
}

/// `"ABCD"` -> `"%AB%CD"`. A trailing odd character becomes its own group.
fn to_percent_encoded(stem: &str) -> String {
    let chars: Vec<char> = stem.chars().collect();
    let mut output = String::with_capacity(stem.len() + stem.len() / 2 + 1);
    for group in chars.chunks(2) {
        output.push('%');
        output.extend(group);
    }
    output
}

pub(crate) fn basename(raw_path: &str) -> &str {
    let trimmed = raw_path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((_, name)) => name,
        None => trimmed,
    }
}

fn file_stem(raw_path: &str) -> &str {
    let name = basename(raw_path);
    match name.rfind('.') {
        Some(index) if !name[..index].chars().all(|ch| ch == '.') => &name[..index],
        _ => name,
    }
}
