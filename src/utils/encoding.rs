//! ISO-8859-1 text, the encoding eTMA `.fhi` files are written in.

use crate::utils::error::{EtmaError, Result};

/// How a text file is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Latin1,
    Utf8,
}

impl TextEncoding {
    pub fn encode(self, text: &str) -> Result<Vec<u8>> {
        match self {
            TextEncoding::Latin1 => encode_latin1(text),
            TextEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        match self {
            TextEncoding::Latin1 => Ok(decode_latin1(bytes)),
            TextEncoding::Utf8 => {
                String::from_utf8(bytes.to_vec()).map_err(|e| EtmaError::EncodingError {
                    message: format!("invalid UTF-8: {}", e),
                })
            }
        }
    }
}

/// Every byte maps to the code point of the same value.
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

pub fn encode_latin1(text: &str) -> Result<Vec<u8>> {
    text.chars()
        .enumerate()
        .map(|(i, c)| {
            u8::try_from(u32::from(c)).map_err(|_| EtmaError::EncodingError {
                message: format!(
                    "character '{}' at position {} cannot be stored in ISO-8859-1",
                    c, i
                ),
            })
        })
        .collect()
}
