// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Parser for `key=value,key=value` option strings.
//!
//! Values may be quoted with `"` to embed commas, and bracketed lists
//! (`[a,b]`) are kept whole as a single value.

use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

mod private_trait {
    // Dispatches to `FromStr::from_str` on externally-defined types and to
    // custom parsing code for types in this module.
    pub trait Parseable
    where
        Self: Sized,
    {
        type Err;
        fn from_str(input: &str) -> Result<Self, <Self as Parseable>::Err>;
    }
}
use private_trait::Parseable;

#[derive(Default)]
pub struct OptionParser {
    options: HashMap<String, OptionParserValue>,
}

struct OptionParserValue {
    value: Option<String>,
    requires_value: bool,
}

#[derive(Error, Debug)]
pub enum OptionParserError {
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),
    #[error("unable to convert {1} for {0}")]
    Conversion(String /* field */, String /* value */),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
type OptionParserResult<T> = std::result::Result<T, OptionParserError>;

fn split_commas(s: &str) -> OptionParserResult<Vec<String>> {
    let mut list: Vec<String> = Vec::new();
    let mut opened_brackets = 0u64;
    let mut in_quotes = false;
    let mut current = String::new();

    for c in s.trim().chars() {
        match c {
            // In quotes, only '"' is special
            '"' => in_quotes = !in_quotes,
            _ if in_quotes => {}
            '[' => opened_brackets += 1,
            ']' => {
                if opened_brackets < 1 {
                    return Err(OptionParserError::InvalidSyntax(s.to_owned()));
                }
                opened_brackets -= 1;
            }
            ',' if opened_brackets == 0 => {
                list.push(current);
                current = String::new();
                continue;
            }
            _ => {}
        };
        current.push(c);
    }
    list.push(current);

    if in_quotes || opened_brackets != 0 {
        return Err(OptionParserError::InvalidSyntax(s.to_owned()));
    }

    Ok(list)
}

impl OptionParser {
    pub fn new() -> Self {
        Self {
            options: HashMap::new(),
        }
    }

    pub fn parse(&mut self, input: &str) -> OptionParserResult<()> {
        if input.trim().is_empty() {
            return Ok(());
        }

        for option in split_commas(input)?.iter() {
            let parts: Vec<&str> = option.splitn(2, '=').collect();
            match self.options.get_mut(parts[0]) {
                None => return Err(OptionParserError::UnknownOption(parts[0].to_owned())),
                Some(value) => {
                    if value.requires_value {
                        if parts.len() != 2 {
                            return Err(OptionParserError::InvalidSyntax((*option).to_owned()));
                        }
                        value.value = Some(parts[1].trim().to_owned());
                    } else {
                        value.value = Some(String::new());
                    }
                }
            }
        }

        Ok(())
    }

    /// Registers an option that takes a value.
    ///
    /// Option names may not contain characters the splitter treats as
    /// special; such a name is a programming error.
    pub fn add(&mut self, option: &str) -> &mut Self {
        debug_assert!(
            !option.contains(['"', '[', ']', '=', ',']),
            "forbidden character in option name"
        );
        self.options.insert(
            option.to_owned(),
            OptionParserValue {
                value: None,
                requires_value: true,
            },
        );

        self
    }

    pub fn add_valueless(&mut self, option: &str) -> &mut Self {
        self.options.insert(
            option.to_owned(),
            OptionParserValue {
                value: None,
                requires_value: false,
            },
        );

        self
    }

    pub fn get(&self, option: &str) -> Option<String> {
        self.options
            .get(option)
            .and_then(|v| v.value.clone())
            .and_then(|s| {
                if s.is_empty() {
                    None
                } else {
                    Some(dequote(&s))
                }
            })
    }

    pub fn is_set(&self, option: &str) -> bool {
        self.options
            .get(option)
            .and_then(|v| v.value.as_ref())
            .is_some()
    }

    pub fn convert<T: Parseable>(&self, option: &str) -> OptionParserResult<Option<T>> {
        match self.options.get(option).and_then(|v| v.value.as_ref()) {
            None => Ok(None),
            Some(v) => {
                Ok(if v.is_empty() {
                    None
                } else {
                    Some(Parseable::from_str(v).map_err(|_| {
                        OptionParserError::Conversion(option.to_owned(), v.to_owned())
                    })?)
                })
            }
        }
    }
}

pub struct Toggle(pub bool);

#[derive(Error, Debug)]
pub enum ToggleParseError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl Parseable for Toggle {
    type Err = ToggleParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" => Ok(Toggle(false)),
            "on" => Ok(Toggle(true)),
            "off" => Ok(Toggle(false)),
            "true" => Ok(Toggle(true)),
            "false" => Ok(Toggle(false)),
            _ => Err(ToggleParseError::InvalidValue(s.to_owned())),
        }
    }
}

pub struct ByteSized(pub u64);

#[derive(Error, Debug)]
pub enum ByteSizedParseError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl FromStr for ByteSized {
    type Err = ByteSizedParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(ByteSized({
            let s = s.trim();
            let shift = if s.ends_with('K') {
                10
            } else if s.ends_with('M') {
                20
            } else if s.ends_with('G') {
                30
            } else {
                0
            };

            let s = s.trim_end_matches(['K', 'M', 'G']);
            s.parse::<u64>()
                .map_err(|_| ByteSizedParseError::InvalidValue(s.to_owned()))?
                << shift
        }))
    }
}

/// A guest physical address, written either in decimal or with a `0x`
/// prefix in hexadecimal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Address(pub u64);

#[derive(Error, Debug)]
pub enum AddressParseError {
    #[error("invalid address: {0}")]
    InvalidValue(String),
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
            None => s.replace('_', "").parse::<u64>(),
        };

        value
            .map(Address)
            .map_err(|_| AddressParseError::InvalidValue(s.to_owned()))
    }
}

fn dequote(s: &str) -> String {
    let mut prev_byte = b'\0';
    let mut in_quotes = false;
    let mut out: Vec<u8> = vec![];
    for i in s.bytes() {
        if i == b'"' {
            if prev_byte == b'"' && !in_quotes {
                out.push(b'"');
            }
            in_quotes = !in_quotes;
        } else {
            out.push(i);
        }
        prev_byte = i
    }
    // Only ASCII quote bytes were removed, so the remaining bytes are
    // still valid UTF-8 when the input was.
    String::from_utf8_lossy(&out).into_owned()
}

impl<T> Parseable for T
where
    T: FromStr + Sized,
{
    type Err = <T as FromStr>::Err;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        dequote(s).parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_parser() {
        let mut parser = OptionParser::new();
        parser
            .add("kernel_irqchip")
            .add("emulation_error")
            .add("readonly_two_step")
            .add("identity_map")
            .add("size");

        assert_eq!(split_commas("\"\"").unwrap(), vec!["\"\""]);
        parser.parse("kernel_irqchip=on,hanging_param").unwrap_err();
        parser
            .parse("kernel_irqchip=on,too_many_equals=foo=bar")
            .unwrap_err();
        parser.parse("kernel_irqchip=on,slots=64").unwrap_err();

        parser.parse("kernel_irqchip=split").unwrap();
        assert_eq!(parser.get("kernel_irqchip"), Some("split".to_owned()));
        assert!(!parser.is_set("emulation_error"));
        assert!(parser.is_set("kernel_irqchip"));
        parser.parse("kernel_irqchip=").unwrap();
        assert!(parser.get("kernel_irqchip").is_none());

        parser
            .parse("emulation_error=permissive,readonly_two_step=off")
            .unwrap();
        assert_eq!(
            parser.get("emulation_error"),
            Some("permissive".to_owned())
        );
        assert!(!parser.convert::<Toggle>("readonly_two_step").unwrap().unwrap().0);

        parser.parse("identity_map=[").unwrap_err();
        parser.parse("identity_map=\"").unwrap_err();
    }

    #[test]
    fn test_address_conversion() {
        let mut parser = OptionParser::new();
        parser.add("identity_map");

        parser.parse("identity_map=0xfeffc000").unwrap();
        assert_eq!(
            parser.convert::<Address>("identity_map").unwrap(),
            Some(Address(0xfeff_c000))
        );
        parser.parse("identity_map=4096").unwrap();
        assert_eq!(
            parser.convert::<Address>("identity_map").unwrap(),
            Some(Address(4096))
        );
        parser.parse("identity_map=0xzz").unwrap();
        parser.convert::<Address>("identity_map").unwrap_err();
    }

    #[test]
    fn test_byte_sized() {
        let mut parser = OptionParser::new();
        parser.add("size");

        parser.parse("size=2M").unwrap();
        assert_eq!(parser.convert::<ByteSized>("size").unwrap().unwrap().0, 2 << 20);
        parser.parse("size=4096").unwrap();
        assert_eq!(parser.convert::<ByteSized>("size").unwrap().unwrap().0, 4096);
    }

    #[test]
    fn check_dequote() {
        assert_eq!(dequote("a\u{3b2}\"a\"\"\""), "a\u{3b2}a\"")
    }
}
