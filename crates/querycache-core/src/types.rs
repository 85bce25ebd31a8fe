use crate::value::DbValue;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

fn cmp_ignore_ascii_case(a: &str, b: &str) -> Ordering {
    a.bytes()
        .map(|c| c.to_ascii_lowercase())
        .cmp(b.bytes().map(|c| c.to_ascii_lowercase()))
}

/// Declares a string newtype whose equality, ordering and hashing ignore ASCII case
/// while keeping the original spelling for display.
macro_rules! case_insensitive_name {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }

            pub fn eq_ignore_case(&self, other: &str) -> bool {
                self.0.eq_ignore_ascii_case(other)
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.0.eq_ignore_ascii_case(&other.0)
            }
        }

        impl Eq for $name {}

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                cmp_ignore_ascii_case(&self.0, &other.0)
            }
        }

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                for byte in self.0.bytes() {
                    state.write_u8(byte.to_ascii_lowercase());
                }
                state.write_u8(0xff);
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

case_insensitive_name!(
    /// A table name as it appears in command text or in the known-table list.
    TableName
);

case_insensitive_name!(
    /// A prefixed dependency tag naming a logical table, used as a secondary
    /// index for group invalidation.
    CacheTag
);

/// Parameter direction as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ParameterDirection {
    #[default]
    Input,
    Output,
    InputOutput,
    ReturnValue,
}

impl fmt::Display for ParameterDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParameterDirection::Input => "Input",
            ParameterDirection::Output => "Output",
            ParameterDirection::InputOutput => "InputOutput",
            ParameterDirection::ReturnValue => "ReturnValue",
        };
        f.write_str(s)
    }
}

/// A bound command parameter with the metadata that takes part in key derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbParameter {
    pub name: String,
    pub value: DbValue,
    pub size: i32,
    pub precision: u8,
    pub scale: u8,
    pub direction: ParameterDirection,
}

impl DbParameter {
    pub fn new(name: impl Into<String>, value: impl Into<DbValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            size: 0,
            precision: 0,
            scale: 0,
            direction: ParameterDirection::Input,
        }
    }

    pub fn with_size(mut self, size: i32) -> Self {
        self.size = size;
        self
    }

    pub fn with_precision(mut self, precision: u8, scale: u8) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }

    pub fn with_direction(mut self, direction: ParameterDirection) -> Self {
        self.direction = direction;
        self
    }
}

/// Maps a known table to the entity type the host model stores in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntityInfo {
    pub table_name: TableName,
    pub entity_type: Option<String>,
}

impl TableEntityInfo {
    pub fn new(table_name: impl Into<TableName>) -> Self {
        Self {
            table_name: table_name.into(),
            entity_type: None,
        }
    }

    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }
}

/// How long a cached entry lives once inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ExpirationMode {
    /// Expires a fixed timeout after insertion.
    #[default]
    Absolute,
    /// Expires once it has not been read for the timeout.
    Sliding,
    /// Stays until invalidated or evicted by the store.
    NeverRemove,
}

impl ExpirationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExpirationMode::Absolute => "Absolute",
            ExpirationMode::Sliding => "Sliding",
            ExpirationMode::NeverRemove => "NeverRemove",
        }
    }
}

impl fmt::Display for ExpirationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExpirationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            m if m.eq_ignore_ascii_case("Absolute") => Ok(ExpirationMode::Absolute),
            m if m.eq_ignore_ascii_case("Sliding") => Ok(ExpirationMode::Sliding),
            m if m.eq_ignore_ascii_case("NeverRemove") => Ok(ExpirationMode::NeverRemove),
            other => Err(format!("Unknown expiration mode: {}", other)),
        }
    }
}

/// How a configured list of names is matched against the names a command touches.
/// All comparisons ignore ASCII case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TableNameComparison {
    /// At least one command name equals a configured name.
    #[default]
    Contains,
    DoesNotContain,
    /// At least one command name starts with a configured name.
    StartsWith,
    DoesNotStartWith,
    /// At least one command name ends with a configured name.
    EndsWith,
    DoesNotEndWith,
    /// The command touches at least one name and every one of them is configured.
    ContainsOnly,
    DoesNotContainOnly,
    /// Every configured name is touched by the command.
    ContainsEvery,
    DoesNotContainEvery,
}

impl TableNameComparison {
    pub fn matches<'a, I>(self, command_names: I, configured: &[String]) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        let names: Vec<&str> = command_names.into_iter().collect();
        let lower = |s: &str| s.to_ascii_lowercase();
        let configured: Vec<String> = configured.iter().map(|c| lower(c)).collect();
        let names: Vec<String> = names.iter().map(|n| lower(n)).collect();

        let any = |pred: &dyn Fn(&str, &str) -> bool| {
            names
                .iter()
                .any(|n| configured.iter().any(|c| pred(n.as_str(), c.as_str())))
        };
        let contains_only =
            || !names.is_empty() && names.iter().all(|n| configured.contains(n));
        let contains_every =
            || !configured.is_empty() && configured.iter().all(|c| names.contains(c));

        match self {
            TableNameComparison::Contains => any(&|n, c| n == c),
            TableNameComparison::DoesNotContain => !any(&|n, c| n == c),
            TableNameComparison::StartsWith => any(&|n, c| n.starts_with(c)),
            TableNameComparison::DoesNotStartWith => !any(&|n, c| n.starts_with(c)),
            TableNameComparison::EndsWith => any(&|n, c| n.ends_with(c)),
            TableNameComparison::DoesNotEndWith => !any(&|n, c| n.ends_with(c)),
            TableNameComparison::ContainsOnly => contains_only(),
            TableNameComparison::DoesNotContainOnly => !contains_only(),
            TableNameComparison::ContainsEvery => contains_every(),
            TableNameComparison::DoesNotContainEvery => !contains_every(),
        }
    }
}
