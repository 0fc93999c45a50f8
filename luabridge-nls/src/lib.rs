use encoding_rs::{Encoding as RsEncoding, GB18030, SHIFT_JIS, UTF_8};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed {encoding} input near byte {offset}")]
    Malformed { encoding: &'static str, offset: usize },
}

pub trait TextDecoder {
    /// Lossy decode: malformed sequences become U+FFFD.
    fn decode<'a>(&self, bytes: &'a [u8]) -> Cow<'a, str>;

    /// Strict decode: the first malformed sequence is an error.
    fn decode_strict<'a>(&self, bytes: &'a [u8]) -> Result<Cow<'a, str>, DecodeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Utf8,
    ShiftJis,
    /// Treat GBK as GB18030 (superset).
    Gbk,
    Gb18030,
}

impl Encoding {
    #[inline]
    pub fn as_encoding_rs(self) -> &'static RsEncoding {
        match self {
            Encoding::Utf8 => UTF_8,
            Encoding::ShiftJis => SHIFT_JIS,
            Encoding::Gbk => GB18030,
            Encoding::Gb18030 => GB18030,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Encoding::Utf8 => "UTF-8",
            Encoding::ShiftJis => "Shift_JIS",
            Encoding::Gbk => "GBK",
            Encoding::Gb18030 => "GB18030",
        }
    }
}

impl std::str::FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(|c: char| c == '-' || c == '_', "").as_str() {
            "utf8" => Ok(Encoding::Utf8),
            "shiftjis" | "sjis" => Ok(Encoding::ShiftJis),
            "gbk" => Ok(Encoding::Gbk),
            "gb18030" => Ok(Encoding::Gb18030),
            other => Err(format!("unknown encoding: {other}")),
        }
    }
}

/// A decoder bound to one encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decoder {
    enc: Encoding,
}

impl Decoder {
    #[inline]
    pub fn new(enc: Encoding) -> Self {
        Self { enc }
    }

    #[inline]
    pub fn encoding(&self) -> Encoding {
        self.enc
    }

    /// Encode a Rust string to bytes using the selected encoding.
    /// Unrepresentable chars are replaced with numeric character references.
    pub fn encode<'a>(&self, s: &'a str) -> Cow<'a, [u8]> {
        let (cow, _, _) = self.enc.as_encoding_rs().encode(s);
        cow
    }
}

impl TextDecoder for Decoder {
    fn decode<'a>(&self, bytes: &'a [u8]) -> Cow<'a, str> {
        match self.enc {
            Encoding::Utf8 => String::from_utf8_lossy(bytes),
            _ => {
                let (cow, _, _) = self.enc.as_encoding_rs().decode(bytes);
                cow
            }
        }
    }

    fn decode_strict<'a>(&self, bytes: &'a [u8]) -> Result<Cow<'a, str>, DecodeError> {
        match self.enc {
            Encoding::Utf8 => std::str::from_utf8(bytes)
                .map(Cow::Borrowed)
                .map_err(|e| DecodeError::Malformed {
                    encoding: self.enc.name(),
                    offset: e.valid_up_to(),
                }),
            _ => self
                .enc
                .as_encoding_rs()
                .decode_without_bom_handling_and_without_replacement(bytes)
                .ok_or(DecodeError::Malformed {
                    encoding: self.enc.name(),
                    offset: 0,
                }),
        }
    }
}
