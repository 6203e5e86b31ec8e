use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobmetrics_backends_core::{BackendError, BackendResult};
use jobmetrics_kv_store::{Command, ReadView, Reply, ScoredMember};

#[derive(Clone, Debug)]
pub(crate) enum Value {
    String(String),
    Hash(HashMap<String, String>),
    Sorted(HashMap<String, f64>),
}

#[derive(Clone, Debug)]
pub(crate) struct Entry {
    pub(crate) value: Value,
    pub(crate) expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn live(&self, key: &str, now: DateTime<Utc>) -> Option<&Entry> {
        self.entries.get(key).filter(|entry| entry.is_live(now))
    }

    pub(crate) fn live_keys(&self, now: DateTime<Utc>) -> impl Iterator<Item = &String> {
        self.entries
            .iter()
            .filter(move |(_, entry)| entry.is_live(now))
            .map(|(key, _)| key)
    }

    pub(crate) fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.entries.retain(|_, entry| entry.is_live(now));
    }

    pub(crate) fn string(&self, key: &str, now: DateTime<Utc>) -> BackendResult<Option<&String>> {
        match self.live(key, now).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::String(value)) => Ok(Some(value)),
            Some(_) => Err(wrong_type(key, "string")),
        }
    }

    pub(crate) fn hash(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> BackendResult<Option<&HashMap<String, String>>> {
        match self.live(key, now).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::Hash(fields)) => Ok(Some(fields)),
            Some(_) => Err(wrong_type(key, "hash")),
        }
    }

    pub(crate) fn sorted_ascending(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> BackendResult<Vec<ScoredMember>> {
        match self.live(key, now).map(|entry| &entry.value) {
            None => Ok(Vec::new()),
            Some(Value::Sorted(members)) => Ok(ascending(members)),
            Some(_) => Err(wrong_type(key, "sorted set")),
        }
    }

    /// Apply commands to staged copies of the touched keys and commit only if
    /// every command succeeds.
    pub(crate) fn apply(
        &mut self,
        commands: Vec<Command>,
        now: DateTime<Utc>,
    ) -> BackendResult<Vec<Reply>> {
        let mut staged: HashMap<String, Option<Entry>> = HashMap::new();
        let mut replies = Vec::with_capacity(commands.len());

        for command in commands {
            let key = command.key().to_string();
            let slot = staged
                .entry(key)
                .or_insert_with_key(|key| self.live(key, now).cloned());
            replies.push(apply_command(slot, command, now)?);
        }

        for (key, slot) in staged {
            match slot {
                Some(entry) => {
                    self.entries.insert(key, entry);
                }
                None => {
                    self.entries.remove(&key);
                }
            }
        }

        Ok(replies)
    }
}

pub(crate) struct LockedView<'a> {
    keyspace: &'a Keyspace,
    now: DateTime<Utc>,
}

impl<'a> LockedView<'a> {
    pub(crate) fn new(keyspace: &'a Keyspace, now: DateTime<Utc>) -> Self {
        Self { keyspace, now }
    }
}

impl ReadView for LockedView<'_> {
    fn get(&self, key: &str) -> BackendResult<Option<String>> {
        self.keyspace
            .string(key, self.now)
            .map(|value| value.cloned())
    }

    fn hash(&self, key: &str) -> BackendResult<Option<HashMap<String, String>>> {
        self.keyspace.hash(key, self.now).map(|value| value.cloned())
    }

    fn sorted_score(&self, key: &str, member: &str) -> BackendResult<Option<f64>> {
        match self.keyspace.live(key, self.now).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::Sorted(members)) => Ok(members.get(member).copied()),
            Some(_) => Err(wrong_type(key, "sorted set")),
        }
    }
}

fn wrong_type(key: &str, expected: &'static str) -> BackendError {
    BackendError::WrongType {
        key: key.to_string(),
        expected,
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> BackendResult<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| BackendError::Message(format!("ttl out of range: {ttl:?}")))
}

fn compare_members(a: &ScoredMember, b: &ScoredMember) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| a.member.cmp(&b.member))
}

fn ascending(members: &HashMap<String, f64>) -> Vec<ScoredMember> {
    let mut sorted: Vec<ScoredMember> = members
        .iter()
        .map(|(member, score)| ScoredMember {
            member: member.clone(),
            score: *score,
        })
        .collect();
    sorted.sort_by(compare_members);
    sorted
}

fn hash_slot<'a>(
    slot: &'a mut Option<Entry>,
    key: &str,
) -> BackendResult<&'a mut HashMap<String, String>> {
    let entry = slot.get_or_insert_with(|| Entry {
        value: Value::Hash(HashMap::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::Hash(fields) => Ok(fields),
        _ => Err(wrong_type(key, "hash")),
    }
}

fn sorted_slot<'a>(
    slot: &'a mut Option<Entry>,
    key: &str,
) -> BackendResult<&'a mut HashMap<String, f64>> {
    let entry = slot.get_or_insert_with(|| Entry {
        value: Value::Sorted(HashMap::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::Sorted(members) => Ok(members),
        _ => Err(wrong_type(key, "sorted set")),
    }
}

/// Sorted sets and hashes vanish once their last member is removed.
fn drop_if_empty(slot: &mut Option<Entry>) {
    let empty = match slot.as_ref().map(|entry| &entry.value) {
        Some(Value::Sorted(members)) => members.is_empty(),
        Some(Value::Hash(fields)) => fields.is_empty(),
        _ => false,
    };
    if empty {
        *slot = None;
    }
}

fn apply_command(
    slot: &mut Option<Entry>,
    command: Command,
    now: DateTime<Utc>,
) -> BackendResult<Reply> {
    match command {
        Command::Set { value, ttl, .. } => {
            let expires_at = ttl.map(|ttl| expiry(now, ttl)).transpose()?;
            *slot = Some(Entry {
                value: Value::String(value),
                expires_at,
            });
            Ok(Reply::Ok)
        }
        Command::Delete { .. } => Ok(Reply::Integer(i64::from(slot.take().is_some()))),
        Command::HashSet { key, fields } => {
            let hash = hash_slot(slot, &key)?;
            let mut added = 0;
            for (field, value) in fields {
                if hash.insert(field, value).is_none() {
                    added += 1;
                }
            }
            Ok(Reply::Integer(added))
        }
        Command::HashIncrBy { key, field, delta } => {
            let hash = hash_slot(slot, &key)?;
            let current = match hash.get(&field) {
                None => 0,
                Some(raw) => raw.parse::<i64>().map_err(|_| {
                    BackendError::Message(format!("hash field {key}.{field} is not an integer"))
                })?,
            };
            let updated = current.checked_add(delta).ok_or_else(|| {
                BackendError::Message(format!("increment overflow at {key}.{field}"))
            })?;
            hash.insert(field, updated.to_string());
            Ok(Reply::Integer(updated))
        }
        Command::HashIncrByFloat { key, field, delta } => {
            let hash = hash_slot(slot, &key)?;
            let current = match hash.get(&field) {
                None => 0.0,
                Some(raw) => raw.parse::<f64>().map_err(|_| {
                    BackendError::Message(format!("hash field {key}.{field} is not a float"))
                })?,
            };
            let updated = current + delta;
            if !updated.is_finite() {
                return Err(BackendError::Message(format!(
                    "increment at {key}.{field} would produce a non-finite value"
                )));
            }
            hash.insert(field, updated.to_string());
            Ok(Reply::Float(updated))
        }
        Command::SortedAdd { key, member, score } => {
            if !score.is_finite() {
                return Err(BackendError::Message(format!(
                    "non-finite score for member of {key}"
                )));
            }
            let members = sorted_slot(slot, &key)?;
            Ok(Reply::Integer(i64::from(
                members.insert(member, score).is_none(),
            )))
        }
        Command::SortedRemove { key, member } => {
            if slot.is_none() {
                return Ok(Reply::Integer(0));
            }
            let removed = sorted_slot(slot, &key)?.remove(&member).is_some();
            drop_if_empty(slot);
            Ok(Reply::Integer(i64::from(removed)))
        }
        Command::SortedRemoveByScore { key, min, max } => {
            if slot.is_none() {
                return Ok(Reply::Integer(0));
            }
            let members = sorted_slot(slot, &key)?;
            let before = members.len();
            members.retain(|_, score| *score < min || *score > max);
            let removed = before - members.len();
            drop_if_empty(slot);
            Ok(Reply::Integer(removed as i64))
        }
        Command::SortedTrimToNewest { key, keep } => {
            if slot.is_none() {
                return Ok(Reply::Integer(0));
            }
            let members = sorted_slot(slot, &key)?;
            if members.len() <= keep {
                return Ok(Reply::Integer(0));
            }
            let excess = members.len() - keep;
            let oldest: Vec<String> = ascending(members)
                .into_iter()
                .take(excess)
                .map(|entry| entry.member)
                .collect();
            for member in &oldest {
                members.remove(member);
            }
            drop_if_empty(slot);
            Ok(Reply::Integer(excess as i64))
        }
        Command::Expire { ttl, .. } => match slot.as_mut() {
            Some(entry) => {
                entry.expires_at = Some(expiry(now, ttl)?);
                Ok(Reply::Integer(1))
            }
            None => Ok(Reply::Integer(0)),
        },
    }
}
