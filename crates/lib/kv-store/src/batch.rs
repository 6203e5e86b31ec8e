use std::time::Duration;

/// A single write primitive.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Overwrite a string value. `ttl: None` makes the key persistent.
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
    /// Set hash fields, keeping any existing expiry.
    HashSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HashIncrBy {
        key: String,
        field: String,
        delta: i64,
    },
    HashIncrByFloat {
        key: String,
        field: String,
        delta: f64,
    },
    SortedAdd {
        key: String,
        member: String,
        score: f64,
    },
    SortedRemove {
        key: String,
        member: String,
    },
    /// Remove members with `min <= score <= max`.
    SortedRemoveByScore {
        key: String,
        min: f64,
        max: f64,
    },
    /// Keep only the `keep` highest-scored members.
    SortedTrimToNewest {
        key: String,
        keep: usize,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

impl Command {
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. }
            | Self::Delete { key }
            | Self::HashSet { key, .. }
            | Self::HashIncrBy { key, .. }
            | Self::HashIncrByFloat { key, .. }
            | Self::SortedAdd { key, .. }
            | Self::SortedRemove { key, .. }
            | Self::SortedRemoveByScore { key, .. }
            | Self::SortedTrimToNewest { key, .. }
            | Self::Expire { key, .. } => key,
        }
    }
}

/// Result of one command inside a batch.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Ok,
    /// Counter value after an increment, or number of removed/added members.
    Integer(i64),
    Float(f64),
}

impl Reply {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }
}

/// Ordered list of commands applied as one unit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    commands: Vec<Command>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.push(Command::Set {
            key: key.into(),
            value: value.into(),
            ttl: None,
        })
    }

    pub fn set_ex(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Duration,
    ) -> &mut Self {
        self.push(Command::Set {
            key: key.into(),
            value: value.into(),
            ttl: Some(ttl),
        })
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::Delete { key: key.into() })
    }

    pub fn hash_set<K, V>(
        &mut self,
        key: impl Into<String>,
        fields: impl IntoIterator<Item = (K, V)>,
    ) -> &mut Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.push(Command::HashSet {
            key: key.into(),
            fields: fields
                .into_iter()
                .map(|(field, value)| (field.into(), value.into()))
                .collect(),
        })
    }

    pub fn hash_incr(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        delta: i64,
    ) -> &mut Self {
        self.push(Command::HashIncrBy {
            key: key.into(),
            field: field.into(),
            delta,
        })
    }

    pub fn hash_incr_float(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        delta: f64,
    ) -> &mut Self {
        self.push(Command::HashIncrByFloat {
            key: key.into(),
            field: field.into(),
            delta,
        })
    }

    pub fn sorted_add(
        &mut self,
        key: impl Into<String>,
        member: impl Into<String>,
        score: f64,
    ) -> &mut Self {
        self.push(Command::SortedAdd {
            key: key.into(),
            member: member.into(),
            score,
        })
    }

    pub fn sorted_remove(
        &mut self,
        key: impl Into<String>,
        member: impl Into<String>,
    ) -> &mut Self {
        self.push(Command::SortedRemove {
            key: key.into(),
            member: member.into(),
        })
    }

    pub fn sorted_remove_by_score(
        &mut self,
        key: impl Into<String>,
        min: f64,
        max: f64,
    ) -> &mut Self {
        self.push(Command::SortedRemoveByScore {
            key: key.into(),
            min,
            max,
        })
    }

    pub fn sorted_trim_to_newest(&mut self, key: impl Into<String>, keep: usize) -> &mut Self {
        self.push(Command::SortedTrimToNewest {
            key: key.into(),
            keep,
        })
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.push(Command::Expire {
            key: key.into(),
            ttl,
        })
    }

    /// Append every command of `other`, preserving order.
    pub fn extend(&mut self, other: Batch) -> &mut Self {
        self.commands.extend(other.commands);
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
