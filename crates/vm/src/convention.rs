//! Calling-convention descriptor strings.
//!
//! A conv string captures a function's uniform ABI in a compact form:
//! a version character, the argument letters, an underscore, and the
//! result letters. Letters are `i` (i32), `I` (i64), `f` (f32),
//! `F` (f64), `r` (ref); `v` denotes an empty list. A trailing
//! `C..D` segment in the argument list marks a variadic tail: the call
//! may append any number of repetitions of the segment's types.
//!
//! Examples: `0ii_i`, `0v_v`, `0rCrD_v`.
//!
//! When both an importer and an exporter declare a non-empty conv
//! string, the two must match byte-for-byte; the mismatch diagnostic is
//! produced at registration time by the context.

use tensile_base::{Status, StatusResult};

use crate::function::Signature;
use crate::value::ValueType;

/// The only supported conv string version.
pub const CONV_VERSION: char = '0';

/// A parsed calling-convention descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvString {
    raw: String,
    signature: Signature,
}

impl ConvString {
    /// Parses a conv string, validating version and letters.
    pub fn parse(raw: &str) -> StatusResult<Self> {
        let mut chars = raw.chars();
        match chars.next() {
            Some(CONV_VERSION) => {}
            Some(other) => {
                return Err(Status::invalid_argument(format!(
                    "unsupported conv string version '{other}' in \"{raw}\""
                )))
            }
            None => {
                return Err(Status::invalid_argument("empty conv string"));
            }
        }

        let rest: String = chars.collect();
        let (arg_part, result_part) = rest.split_once('_').ok_or_else(|| {
            Status::invalid_argument(format!(
                "conv string \"{raw}\" is missing the '_' separator"
            ))
        })?;

        let (args, variadic) = parse_arg_letters(raw, arg_part)?;
        let (results, trailing_variadic) = parse_arg_letters(raw, result_part)?;
        if !trailing_variadic.is_empty() {
            return Err(Status::invalid_argument(format!(
                "conv string \"{raw}\" declares a variadic result segment"
            )));
        }

        Ok(Self {
            raw: raw.to_string(),
            signature: Signature::with_variadic(args, results, variadic),
        })
    }

    /// Builds the canonical conv string for a signature.
    pub fn for_signature(signature: &Signature) -> Self {
        let mut raw = String::new();
        raw.push(CONV_VERSION);
        push_letters(&mut raw, signature.args());
        if !signature.variadic().is_empty() {
            raw.push('C');
            push_letters(&mut raw, signature.variadic());
            raw.push('D');
        }
        raw.push('_');
        push_letters(&mut raw, signature.results());
        Self {
            raw,
            signature: signature.clone(),
        }
    }

    /// The raw descriptor text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The signature the descriptor denotes.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}

impl std::fmt::Display for ConvString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

fn push_letters(out: &mut String, types: &[ValueType]) {
    if types.is_empty() {
        out.push('v');
    } else {
        for ty in types {
            out.push(ty.conv_letter());
        }
    }
}

fn letter_type(letter: char) -> Option<ValueType> {
    match letter {
        'i' => Some(ValueType::I32),
        'I' => Some(ValueType::I64),
        'f' => Some(ValueType::F32),
        'F' => Some(ValueType::F64),
        'r' => Some(ValueType::Ref),
        _ => None,
    }
}

fn parse_arg_letters(raw: &str, part: &str) -> StatusResult<(Vec<ValueType>, Vec<ValueType>)> {
    if part == "v" || part.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }
    let mut fixed = Vec::new();
    let mut variadic = Vec::new();
    let mut in_segment = false;
    let mut segment_closed = false;
    for letter in part.chars() {
        match letter {
            'C' if !in_segment && !segment_closed => in_segment = true,
            'D' if in_segment => {
                in_segment = false;
                segment_closed = true;
            }
            _ => {
                let ty = letter_type(letter).ok_or_else(|| {
                    Status::invalid_argument(format!(
                        "invalid conv string letter '{letter}' in \"{raw}\""
                    ))
                })?;
                if segment_closed {
                    return Err(Status::invalid_argument(format!(
                        "conv string \"{raw}\" has letters after the variadic segment"
                    )));
                }
                if in_segment {
                    variadic.push(ty);
                } else {
                    fixed.push(ty);
                }
            }
        }
    }
    if in_segment {
        return Err(Status::invalid_argument(format!(
            "conv string \"{raw}\" has an unterminated variadic segment"
        )));
    }
    Ok((fixed, variadic))
}

/// Checks the byte-for-byte match rule for an import/export pair.
///
/// Empty descriptors opt out of the check; when both sides declare one,
/// any difference is a registration-time error naming both modules.
pub fn check_conv_match(
    importer_module: &str,
    importer_conv: &str,
    exporter_module: &str,
    exporter_conv: &str,
) -> StatusResult<()> {
    if importer_conv.is_empty() || exporter_conv.is_empty() {
        return Ok(());
    }
    if importer_conv != exporter_conv {
        return Err(Status::failed_precondition(format!(
            "calling convention mismatch: module '{importer_module}' imports with \
             \"{importer_conv}\" but module '{exporter_module}' exports with \
             \"{exporter_conv}\""
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensile_base::StatusKind;

    #[test]
    fn test_parse_simple() {
        let conv = ConvString::parse("0ii_i").unwrap();
        assert_eq!(
            conv.signature().args(),
            &[ValueType::I32, ValueType::I32]
        );
        assert_eq!(conv.signature().results(), &[ValueType::I32]);
    }

    #[test]
    fn test_parse_void() {
        let conv = ConvString::parse("0v_v").unwrap();
        assert!(conv.signature().args().is_empty());
        assert!(conv.signature().results().is_empty());
    }

    #[test]
    fn test_parse_variadic() {
        let conv = ConvString::parse("0rCrD_v").unwrap();
        assert_eq!(conv.signature().args(), &[ValueType::Ref]);
        assert_eq!(conv.signature().variadic(), &[ValueType::Ref]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(ConvString::parse("").is_err());
        assert!(ConvString::parse("1i_i").is_err());
        assert!(ConvString::parse("0x_v").is_err());
        assert!(ConvString::parse("0iCi_v").is_err());
        assert!(ConvString::parse("0ii").is_err());
    }

    #[test]
    fn test_canonical_roundtrip() {
        for raw in ["0ii_i", "0v_v", "0rfIF_r", "0rCrD_v"] {
            let parsed = ConvString::parse(raw).unwrap();
            let rebuilt = ConvString::for_signature(parsed.signature());
            assert_eq!(rebuilt.as_str(), raw);
        }
    }

    #[test]
    fn test_conv_match() {
        assert!(check_conv_match("a", "0i_i", "b", "0i_i").is_ok());
        assert!(check_conv_match("a", "", "b", "0i_i").is_ok());
        let err = check_conv_match("a", "0i_i", "b", "0I_i").unwrap_err();
        assert!(err.is(StatusKind::FailedPrecondition));
        let message = err.message().unwrap_or_default();
        assert!(message.contains("'a'") && message.contains("'b'"));
        assert!(message.contains("0i_i") && message.contains("0I_i"));
    }
}
