//! Core entry model, composite keys and file naming for konnector-sync.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "ksync-core";

pub const DATE_FIELD: &str = "date";
pub const VENDOR_FIELD: &str = "vendor";
pub const PDF_URL_FIELD: &str = "pdfurl";
pub const FILE_FIELD: &str = "file";
pub const FILENAME_FIELD: &str = "filename";
pub const ID_FIELD: &str = "_id";

/// Separator between field values inside a [`CompositeKey`].
pub const KEY_DELIMITER: &str = "####";

const DAY_KEY_FORMAT: &str = "%Y/%m/%d";
const FILE_NAME_FORBIDDEN: &[char] = &['/', '?', '<', '>', '\\', ':', '*', '|', '"'];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntryError {
    #[error("missing required field `{field}`")]
    MissingField { field: String },
    #[error("field `{field}` is not a canonical date (found {found})")]
    NonCanonicalDate { field: String, found: String },
    #[error("could not derive a file name for the entry")]
    NoFileName,
    #[error("unterminated placeholder in file name template `{template}`")]
    BadTemplate { template: String },
    #[error("invalid folder path `{path}`")]
    InvalidFolderPath { path: String },
    #[error("entry must be a JSON object, got {0}")]
    NotAnObject(String),
}

/// Typed value held by an [`Entry`] field.
///
/// Deserialization is untagged: RFC 3339 strings become [`FieldValue::Date`],
/// every other string stays [`FieldValue::Text`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Date(DateTime<Utc>),
    Text(String),
    List(Vec<String>),
    Json(JsonValue),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Value equality used for matching: integers and integral floats with the
    /// same value are equal, everything else compares structurally.
    pub fn same_value(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (Self::Int(i), Self::Float(f)) | (Self::Float(f), Self::Int(i)) => *i as f64 == *f,
            _ => self == other,
        }
    }

    /// Rendering used when the value takes part in a composite key.
    pub fn key_fragment(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => {
                format!("{}", *f as i64)
            }
            Self::Float(f) => f.to_string(),
            Self::Date(d) => d.to_rfc3339_opts(SecondsFormat::Millis, true),
            Self::Text(s) => s.clone(),
            Self::List(items) => items.join(","),
            Self::Json(v) => v.to_string(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Date(value)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(day_start_utc(value))
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

/// One scraped record awaiting persistence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entry {
    fields: BTreeMap<String, FieldValue>,
}

impl Entry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Builds an entry from a JSON object, promoting a textual `date` to a
    /// timestamp when it parses as a day or an RFC 3339 instant.
    pub fn from_json(value: JsonValue) -> Result<Self, EntryError> {
        let JsonValue::Object(map) = value else {
            return Err(EntryError::NotAnObject(json_kind(&value).to_string()));
        };
        let mut entry = Entry::new();
        for (key, raw) in map {
            let value = serde_json::from_value::<FieldValue>(raw.clone())
                .unwrap_or(FieldValue::Json(raw));
            entry.fields.insert(key, value);
        }
        entry.promote_textual_date();
        Ok(entry)
    }

    /// Turns a textual `date` that parses as a day or instant into a
    /// timestamp. Returns whether the field changed.
    pub fn promote_textual_date(&mut self) -> bool {
        match self.text(DATE_FIELD).and_then(parse_day) {
            Some(parsed) => {
                self.insert(DATE_FIELD, parsed);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        self.fields.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(FieldValue::as_text)
    }

    pub fn vendor(&self) -> Option<&str> {
        self.text(VENDOR_FIELD)
    }

    pub fn pdf_url(&self) -> Option<&str> {
        self.text(PDF_URL_FIELD).filter(|s| !s.is_empty())
    }

    pub fn file_id(&self) -> Option<&str> {
        self.text(FILE_FIELD)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Calendar day of the `date` field, rejecting anything but a timestamp.
    pub fn day(&self) -> Result<NaiveDate, EntryError> {
        match self.get(DATE_FIELD) {
            Some(FieldValue::Date(d)) => Ok(d.date_naive()),
            Some(other) => Err(EntryError::NonCanonicalDate {
                field: DATE_FIELD.to_string(),
                found: other.key_fragment(),
            }),
            None => Err(EntryError::MissingField {
                field: DATE_FIELD.to_string(),
            }),
        }
    }

    /// Rewrites `date` to 00:00:00 UTC of its calendar day. Entries without a
    /// date are left alone.
    pub fn canonicalize_date(&mut self) -> Result<(), EntryError> {
        if !self.contains(DATE_FIELD) {
            return Ok(());
        }
        let day = self.day()?;
        self.insert(DATE_FIELD, day_start_utc(day));
        Ok(())
    }

    /// Merges `other` into `self`; fields present in both take `other`'s value.
    pub fn merge(&mut self, other: &Entry) {
        for (key, value) in other.iter() {
            self.fields.insert(key.clone(), value.clone());
        }
    }
}

impl FromIterator<(String, FieldValue)> for Entry {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Persisted entry, owned by the store. Textual dates written by other
/// clients are promoted on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredRecordRepr")]
pub struct StoredRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev")]
    pub rev: String,
    #[serde(flatten)]
    pub fields: Entry,
}

impl StoredRecord {
    pub fn vendor(&self) -> Option<&str> {
        self.fields.vendor()
    }
}

#[derive(Deserialize)]
struct StoredRecordRepr {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_rev")]
    rev: String,
    #[serde(flatten)]
    fields: Entry,
}

impl From<StoredRecordRepr> for StoredRecord {
    fn from(repr: StoredRecordRepr) -> Self {
        let mut fields = repr.fields;
        fields.promote_textual_date();
        Self {
            id: repr.id,
            rev: repr.rev,
            fields,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

/// Fingerprint attached to files created by this system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_id_attributes: Option<String>,
    pub source_account_identifier: Option<String>,
    pub created_by_app: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    #[serde(rename = "_id")]
    pub id: String,
    pub kind: FileKind,
    pub name: String,
    pub path: String,
    pub dir_id: Option<String>,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub size: u64,
    pub content_type: Option<String>,
    #[serde(default)]
    pub metadata: Option<FileMetadata>,
}

/// Delimiter-joined values of selected fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompositeKey(String);

impl CompositeKey {
    /// Key used for deduplication. `date` is rendered as `YYYY/MM/DD` so
    /// intra-day time differences do not defeat matching; missing fields
    /// contribute an empty fragment.
    pub fn for_entry(entry: &Entry, keys: &[String]) -> Result<Self, EntryError> {
        let mut fragments = Vec::with_capacity(keys.len());
        for key in keys {
            if key == DATE_FIELD {
                fragments.push(entry.day()?.format(DAY_KEY_FORMAT).to_string());
            } else {
                fragments.push(entry.get(key).map(FieldValue::key_fragment).unwrap_or_default());
            }
        }
        Ok(Self(fragments.join(KEY_DELIMITER)))
    }

    /// Metadata fingerprint of a file: same rendering as [`Self::for_entry`]
    /// over the fingerprint fields in sorted order.
    pub fn fingerprint(entry: &Entry, fields: &[String]) -> Result<Self, EntryError> {
        let mut sorted = fields.to_vec();
        sorted.sort();
        Self::for_entry(entry, &sorted)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn default_key_fields() -> Vec<String> {
    vec![DATE_FIELD.to_string()]
}

/// Strips characters that would break a path, and blanks dot-only names.
pub fn sanitize_file_name(name: &str) -> String {
    if !name.is_empty() && name.chars().all(|c| c == '.') {
        return String::new();
    }
    name.chars()
        .filter(|c| !FILE_NAME_FORBIDDEN.contains(c))
        .collect()
}

/// File name template such as `{date}_{vendor}_{amount}.pdf`. `date` renders
/// as `YYYY-MM-DD`, other placeholders use the key rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileNamingRule {
    template: String,
}

impl FileNamingRule {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn render(&self, entry: &Entry) -> Result<String, EntryError> {
        let mut out = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| EntryError::BadTemplate {
                template: self.template.clone(),
            })?;
            let field = &after[..close];
            if field == DATE_FIELD {
                out.push_str(&entry.day()?.format("%Y-%m-%d").to_string());
            } else {
                let value = entry.get(field).ok_or_else(|| EntryError::MissingField {
                    field: field.to_string(),
                })?;
                out.push_str(&value.key_fragment());
            }
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// Deterministic file name for an entry: naming rule, else the `filename`
/// field, else the last path segment of `pdfurl`. Always sanitized.
pub fn entry_file_name(entry: &Entry, rule: Option<&FileNamingRule>) -> Result<String, EntryError> {
    let raw = match rule {
        Some(rule) => rule.render(entry)?,
        None => match entry.text(FILENAME_FIELD) {
            Some(name) => name.to_string(),
            None => entry.pdf_url().map(url_basename).unwrap_or_default(),
        },
    };
    let name = sanitize_file_name(&raw);
    if name.is_empty() {
        return Err(EntryError::NoFileName);
    }
    Ok(name)
}

fn url_basename(url: &str) -> String {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let path = &url[..end];
    let path = path.split_once("://").map(|(_, rest)| rest).unwrap_or(path);
    match path.split_once('/') {
        Some((_host, tail)) => tail.rsplit('/').next().unwrap_or_default().to_string(),
        None => String::new(),
    }
}

pub fn day_start_utc(day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN))
}

/// Lenient date parsing used when loading entries from text sources.
pub fn parse_day(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Some(Utc.from_utc_datetime(&dt));
    }
    ["%Y-%m-%d", "%Y/%m/%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        .map(day_start_utc)
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Upstream context: destination folder plus opaque credentials.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredFields {
    pub folder_path: String,
    #[serde(default, flatten)]
    pub credentials: BTreeMap<String, String>,
}

impl RequiredFields {
    pub fn new(folder_path: impl Into<String>) -> Self {
        Self {
            folder_path: folder_path.into(),
            credentials: BTreeMap::new(),
        }
    }

    /// Folder path with a leading slash and no trailing slash.
    pub fn normalized_folder_path(&self) -> Result<String, EntryError> {
        let trimmed = self.folder_path.trim().trim_end_matches('/');
        let invalid = || EntryError::InvalidFolderPath {
            path: self.folder_path.clone(),
        };
        if trimmed.is_empty() {
            return Err(invalid());
        }
        if trimmed.split('/').any(|segment| segment == "..") {
            return Err(invalid());
        }
        if trimmed.starts_with('/') {
            Ok(trimmed.to_string())
        } else {
            Ok(format!("/{trimmed}"))
        }
    }
}

impl fmt::Debug for RequiredFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequiredFields")
            .field("folder_path", &self.folder_path)
            .field("credentials", &format!("<{} redacted>", self.credentials.len()))
            .finish()
    }
}
