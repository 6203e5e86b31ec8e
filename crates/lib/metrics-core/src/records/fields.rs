//! Typed access to hash-shaped records.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::RecordError;
use crate::time::{from_millis, to_millis};

pub(crate) struct Fields<'a> {
    map: &'a HashMap<String, String>,
}

impl<'a> Fields<'a> {
    pub(crate) fn new(map: &'a HashMap<String, String>) -> Self {
        Self { map }
    }

    pub(crate) fn text(&self, field: &'static str) -> Option<&'a str> {
        self.map
            .get(field)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub(crate) fn required_text(&self, field: &'static str) -> Result<String, RecordError> {
        self.text(field)
            .map(str::to_string)
            .ok_or(RecordError::Missing { field })
    }

    pub(crate) fn parse_or<T: FromStr>(
        &self,
        field: &'static str,
        default: T,
    ) -> Result<T, RecordError> {
        match self.text(field) {
            None => Ok(default),
            Some(raw) => raw.parse::<T>().map_err(|_| RecordError::Corrupt {
                field,
                value: raw.to_string(),
            }),
        }
    }

    pub(crate) fn required<T: FromStr>(&self, field: &'static str) -> Result<T, RecordError> {
        let raw = self.text(field).ok_or(RecordError::Missing { field })?;
        raw.parse::<T>().map_err(|_| RecordError::Corrupt {
            field,
            value: raw.to_string(),
        })
    }

    pub(crate) fn time(&self, field: &'static str) -> Result<Option<DateTime<Utc>>, RecordError> {
        match self.text(field) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .and_then(from_millis)
                .map(Some)
                .ok_or_else(|| RecordError::Corrupt {
                    field,
                    value: raw.to_string(),
                }),
        }
    }

    pub(crate) fn required_time(&self, field: &'static str) -> Result<DateTime<Utc>, RecordError> {
        self.time(field)?.ok_or(RecordError::Missing { field })
    }
}

/// Builder for the field list written by `Batch::hash_set`.
#[derive(Default)]
pub(crate) struct FieldWriter {
    fields: Vec<(String, String)>,
}

impl FieldWriter {
    pub(crate) fn put(&mut self, field: &str, value: impl ToString) -> &mut Self {
        self.fields.push((field.to_string(), value.to_string()));
        self
    }

    pub(crate) fn put_time(&mut self, field: &str, at: DateTime<Utc>) -> &mut Self {
        self.put(field, to_millis(at))
    }

    pub(crate) fn put_opt(&mut self, field: &str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value {
            self.put(field, value);
        }
        self
    }

    pub(crate) fn finish(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.fields)
    }
}
