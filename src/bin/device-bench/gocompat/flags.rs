//! Flag definitions and parsing in the syntax of Go's "flag" package.
//!
//! Link to the Go package: https://pkg.go.dev/flag

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;

use super::strconv;

/// A type which can be the value of a flag.
pub trait GoValue: Sized + 'static {
    fn parse(s: &str) -> Result<Self>;
    fn to_string(&self) -> String;

    /// Zero values are not mentioned as defaults in the help message.
    fn is_zero_value(&self) -> bool {
        false
    }

    /// Boolean flags may be given without a value.
    fn is_bool_flag() -> bool {
        false
    }

    /// Placeholder for the value in the help message.
    fn type_name() -> &'static str {
        "value"
    }
}

impl GoValue for bool {
    fn parse(s: &str) -> Result<Self> {
        strconv::parse_bool(s)
    }

    fn to_string(&self) -> String {
        format!("{self}")
    }

    fn is_zero_value(&self) -> bool {
        !*self
    }

    fn is_bool_flag() -> bool {
        true
    }

    fn type_name() -> &'static str {
        ""
    }
}

impl GoValue for u64 {
    fn parse(s: &str) -> Result<Self> {
        strconv::parse_uint(s)
    }

    fn to_string(&self) -> String {
        format!("{self}")
    }

    fn is_zero_value(&self) -> bool {
        *self == 0
    }

    fn type_name() -> &'static str {
        "uint"
    }
}

impl GoValue for String {
    fn parse(s: &str) -> Result<Self> {
        Ok(s.to_string())
    }

    fn to_string(&self) -> String {
        strconv::quote_string(self)
    }

    fn is_zero_value(&self) -> bool {
        self.is_empty()
    }

    fn type_name() -> &'static str {
        "string"
    }
}

impl GoValue for Duration {
    fn parse(s: &str) -> Result<Self> {
        strconv::parse_duration(s)
    }

    fn to_string(&self) -> String {
        strconv::format_duration(*self)
    }

    fn is_zero_value(&self) -> bool {
        self.is_zero()
    }

    fn type_name() -> &'static str {
        "duration"
    }
}

/// Returned by [`Parser::parse_args`] when `-help` or `-h` is given
/// and no flag of that name is defined.
#[derive(Debug)]
pub struct HelpRequested;

impl std::fmt::Display for HelpRequested {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "help requested")
    }
}

impl std::error::Error for HelpRequested {}

type Slot<T> = Rc<RefCell<Option<T>>>;

struct FlagDef {
    usage: &'static str,
    default: Option<String>,
    type_name: &'static str,
    is_bool: bool,
    setter: Box<dyn Fn(&str) -> Result<()>>,
}

impl FlagDef {
    // A name quoted with backticks in the usage string replaces the type name
    // in the help message, e.g. "read at most `N` rows".
    fn value_name_and_usage(&self) -> (&str, String) {
        match self.usage.splitn(3, '`').collect::<Vec<_>>().as_slice() {
            [left, name, right] => (*name, format!("{left}{name}{right}")),
            _ => (self.type_name, self.usage.to_string()),
        }
    }
}

/// A handle to the value of a flag, filled in by the [`Parser`].
pub struct FlagValue<T: GoValue> {
    slot: Slot<T>,
}

impl<T: GoValue> FlagValue<T> {
    /// Returns the parsed value, or the default if the flag was not given.
    pub fn get(self) -> T {
        // The slot is filled with the default at definition time and only
        // replaced afterwards, so it can't be empty
        self.slot
            .borrow_mut()
            .take()
            .expect("flag value taken twice")
    }
}

type FlagMap = BTreeMap<&'static str, FlagDef>;

/// Collects flag definitions.
#[derive(Default)]
pub struct ParserBuilder {
    flags: FlagMap,
}

impl ParserBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits the definitions into a parser and a description for the help message.
    pub fn build(self) -> (Parser, FlagSetDescription) {
        let flags = Rc::new(self.flags);
        (
            Parser {
                flags: Rc::clone(&flags),
            },
            FlagSetDescription { flags },
        )
    }

    pub fn bool_var(
        &mut self,
        name: &'static str,
        default: bool,
        usage: &'static str,
    ) -> FlagValue<bool> {
        self.var(name, default, usage)
    }

    pub fn string_var(
        &mut self,
        name: &'static str,
        default: impl Into<String>,
        usage: &'static str,
    ) -> FlagValue<String> {
        self.var(name, default.into(), usage)
    }

    pub fn u64_var(
        &mut self,
        name: &'static str,
        default: u64,
        usage: &'static str,
    ) -> FlagValue<u64> {
        self.var(name, default, usage)
    }

    pub fn duration_var(
        &mut self,
        name: &'static str,
        default: Duration,
        usage: &'static str,
    ) -> FlagValue<Duration> {
        self.var(name, default, usage)
    }

    /// Defines a flag of any type implementing [`GoValue`].
    pub fn var<T: GoValue>(
        &mut self,
        name: &'static str,
        default: T,
        usage: &'static str,
    ) -> FlagValue<T> {
        assert!(
            !name.is_empty() && !name.starts_with('-') && !name.contains('='),
            "Invalid flag name: {name:?}"
        );

        let default_s = (!default.is_zero_value()).then(|| default.to_string());
        let slot: Slot<T> = Rc::new(RefCell::new(Some(default)));
        let setter_slot = Rc::clone(&slot);
        let def = FlagDef {
            usage,
            default: default_s,
            type_name: T::type_name(),
            is_bool: T::is_bool_flag(),
            setter: Box::new(move |s| {
                *setter_slot.borrow_mut() = Some(T::parse(s)?);
                Ok(())
            }),
        };

        let previous = self.flags.insert(name, def);
        assert!(previous.is_none(), "Flag {name} was defined more than once");

        FlagValue { slot }
    }
}

pub struct Parser {
    flags: Rc<FlagMap>,
}

impl Parser {
    /// Parses the arguments, without the program name.
    ///
    /// Accepted forms, with one or two leading dashes:
    /// -name=value
    /// -name value  (non-boolean flags only)
    /// -name        (boolean flags only)
    ///
    /// A lone "--" ends the flags.
    pub fn parse_args<I, S>(self, mut args: I) -> Result<()>
    where
        I: Iterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();

        while let Some(arg) = args.next() {
            let arg = arg.as_ref();
            if arg == "--" {
                break;
            }

            let body = arg
                .strip_prefix("--")
                .or_else(|| arg.strip_prefix('-'))
                .ok_or_else(|| anyhow::anyhow!("Expected a flag, but got {}", arg))?;
            anyhow::ensure!(
                !body.is_empty() && !body.starts_with(['-', '=']),
                "Bad flag syntax: {}",
                arg,
            );

            let (name, inline_value) = match body.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (body, None),
            };
            let flag = match self.flags.get(name) {
                Some(flag) => flag,
                None if name == "help" || name == "h" => return Err(HelpRequested.into()),
                None => anyhow::bail!("Flag provided but not defined: -{}", name),
            };
            anyhow::ensure!(
                seen.insert(name.to_string()),
                "Flag -{} was provided twice",
                name,
            );

            let result = match inline_value {
                Some(value) => (flag.setter)(value),
                None if flag.is_bool => (flag.setter)("true"),
                None => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("Flag needs an argument: -{}", name))?;
                    (flag.setter)(value.as_ref())
                }
            };
            result.map_err(|err| anyhow::anyhow!("Invalid value for flag -{}: {}", name, err))?;
        }

        Ok(())
    }
}

pub struct FlagSetDescription {
    flags: Rc<FlagMap>,
}

impl FlagSetDescription {
    /// Prints the usage message in the format of Go's flag.PrintDefaults.
    pub fn print_help(&self, out: &mut impl Write, program_name: &str) -> Result<()> {
        writeln!(out, "Usage of {program_name}:")?;

        for (name, flag) in self.flags.iter() {
            let (value_name, usage) = flag.value_name_and_usage();
            let mut line = format!("  -{name}");
            if !value_name.is_empty() {
                line.push(' ');
                line.push_str(value_name);
            }
            if name.len() == 1 {
                line.push('\t');
            } else {
                line.push_str("\n    \t");
            }
            line.push_str(&usage.replace('\n', "\n    \t"));
            if let Some(default) = &flag.default {
                line.push_str(&format!(" (default {default})"));
            }
            writeln!(out, "{line}")?;
        }

        Ok(())
    }
}
