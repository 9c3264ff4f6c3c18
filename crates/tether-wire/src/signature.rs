//! Type-signature parsing and validation.
//!
//! A signature is a string of [`TypeId`] characters describing zero or more
//! complete types, e.g. `"susa(yv)"`. Array and struct nesting are each
//! bounded at [`MAX_NESTING_DEPTH`](crate::MAX_NESTING_DEPTH) levels.

use crate::error::WireError;
use crate::MAX_NESTING_DEPTH;

/// Upper bound on a signature's byte length, including nothing but the
/// signature characters themselves.
pub const MAX_SIGNATURE_LEN: usize = 255;

/// Validate that `sig` is a well-formed sequence of complete types.
///
/// # Errors
///
/// Returns `WireError::BadSignature` on malformed or over-deep signatures.
pub fn validate(sig: &str) -> Result<(), WireError> {
    count_complete_types(sig).map(|_| ())
}

/// Number of complete types in `sig`.
///
/// # Errors
///
/// Returns `WireError::BadSignature` on malformed or over-deep signatures.
pub fn count_complete_types(sig: &str) -> Result<usize, WireError> {
    if sig.len() > MAX_SIGNATURE_LEN {
        return Err(WireError::BadSignature(format!(
            "signature of {} bytes exceeds {MAX_SIGNATURE_LEN}",
            sig.len()
        )));
    }

    let mut parser = SigParser::new(sig);
    let mut count = 0;
    while !parser.at_end() {
        parser.parse_one()?;
        count += 1;
    }
    Ok(count)
}

/// Split `sig` into its first complete type and the remainder.
///
/// # Errors
///
/// Returns `WireError::BadSignature` if `sig` is empty or does not start
/// with a complete type.
pub fn first_complete_type(sig: &str) -> Result<(&str, &str), WireError> {
    if sig.is_empty() {
        return Err(WireError::BadSignature("empty signature".into()));
    }
    let mut parser = SigParser::new(sig);
    parser.parse_one()?;
    Ok(sig.split_at(parser.pos))
}

struct SigParser<'a> {
    bytes: &'a [u8],
    pos: usize,
    array_depth: usize,
    struct_depth: usize,
}

impl<'a> SigParser<'a> {
    fn new(sig: &'a str) -> Self {
        Self {
            bytes: sig.as_bytes(),
            pos: 0,
            array_depth: 0,
            struct_depth: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn next(&mut self) -> Result<u8, WireError> {
        let Some(&c) = self.bytes.get(self.pos) else {
            return Err(WireError::BadSignature("truncated signature".into()));
        };
        self.pos += 1;
        Ok(c)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn parse_one(&mut self) -> Result<(), WireError> {
        match self.next()? {
            b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o'
            | b'g' | b'h' | b'v' => Ok(()),
            b'a' => {
                self.array_depth += 1;
                if self.array_depth > MAX_NESTING_DEPTH {
                    return Err(WireError::BadSignature(format!(
                        "array nesting exceeds {MAX_NESTING_DEPTH}"
                    )));
                }
                self.parse_one()?;
                self.array_depth -= 1;
                Ok(())
            }
            b'(' => {
                self.struct_depth += 1;
                if self.struct_depth > MAX_NESTING_DEPTH {
                    return Err(WireError::BadSignature(format!(
                        "struct nesting exceeds {MAX_NESTING_DEPTH}"
                    )));
                }
                if self.peek() == Some(b')') {
                    return Err(WireError::BadSignature("empty struct".into()));
                }
                loop {
                    match self.peek() {
                        Some(b')') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => self.parse_one()?,
                        None => {
                            return Err(WireError::BadSignature("unterminated struct".into()));
                        }
                    }
                }
                self.struct_depth -= 1;
                Ok(())
            }
            b'{' => {
                self.struct_depth += 1;
                if self.struct_depth > MAX_NESTING_DEPTH {
                    return Err(WireError::BadSignature(format!(
                        "struct nesting exceeds {MAX_NESTING_DEPTH}"
                    )));
                }
                // Key must be a basic type.
                match self.next()? {
                    b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's'
                    | b'o' | b'g' | b'h' => {}
                    c => {
                        return Err(WireError::BadSignature(format!(
                            "dict entry key '{}' is not a basic type",
                            c as char
                        )));
                    }
                }
                self.parse_one()?;
                if self.next()? != b'}' {
                    return Err(WireError::BadSignature("unterminated dict entry".into()));
                }
                self.struct_depth -= 1;
                Ok(())
            }
            c => Err(WireError::BadSignature(format!(
                "unexpected character '{}'",
                c as char
            ))),
        }
    }
}
