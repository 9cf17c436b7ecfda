//! Header fields, pseudo-headers and field-section validation.
//!
//! Regular header names keep the case they were given in; lookups compare
//! case-insensitively. Order and duplicates are preserved.

use crate::error::MalformedReason;

/// A single name/value pair as carried in a field section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is_pseudo(&self) -> bool {
        self.name.starts_with(':')
    }
}

/// Ordered list of regular (non-pseudo) header fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<HeaderField>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, keeping any existing fields with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push(HeaderField::new(name, value));
    }

    /// Replace all fields named `name` with a single one.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.fields.push(HeaderField::new(name, value));
    }

    /// Remove all fields named `name`, returning how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.fields.len();
        self.fields.retain(|f| !f.name.eq_ignore_ascii_case(name));
        before - self.fields.len()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.value.as_str())
    }

    /// All values for `name`, in order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.value.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderField> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Append every field of `other`.
    pub fn extend(&mut self, other: Headers) {
        self.fields.extend(other.fields);
    }

    /// Group values by name, in order of first appearance.
    ///
    /// Names that differ only in case are grouped under the first spelling.
    pub fn to_multimap(&self) -> Vec<(String, Vec<String>)> {
        let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
        for field in &self.fields {
            match grouped
                .iter_mut()
                .find(|(name, _)| name.eq_ignore_ascii_case(&field.name))
            {
                Some((_, values)) => values.push(field.value.clone()),
                None => grouped.push((field.name.clone(), vec![field.value.clone()])),
            }
        }
        grouped
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(name, value)| HeaderField { name, value })
                .collect(),
        }
    }
}

/// The pseudo-header fields of a request or response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PseudoHeaders {
    pub method: Option<String>,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: Option<String>,
    pub protocol: Option<String>,
    pub status: Option<String>,
}

impl PseudoHeaders {
    fn slot(&mut self, name: &str) -> Option<&mut Option<String>> {
        match name {
            ":method" => Some(&mut self.method),
            ":scheme" => Some(&mut self.scheme),
            ":authority" => Some(&mut self.authority),
            ":path" => Some(&mut self.path),
            ":protocol" => Some(&mut self.protocol),
            ":status" => Some(&mut self.status),
            _ => None,
        }
    }
}

/// A decoded HEADERS frame: pseudo-headers followed by regular headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSection {
    pub pseudo: PseudoHeaders,
    pub headers: Headers,
}

impl FieldSection {
    /// Split decoded fields into pseudo and regular headers.
    ///
    /// Pseudo-headers must precede regular ones and appear at most once;
    /// unknown pseudo-headers are rejected.
    pub fn from_fields(fields: Vec<HeaderField>) -> Result<Self, MalformedReason> {
        let mut section = FieldSection::default();
        let mut saw_regular = false;
        for field in fields {
            if field.is_pseudo() {
                if saw_regular {
                    return Err(MalformedReason::PseudoHeaderAfterRegular);
                }
                let slot = section
                    .pseudo
                    .slot(&field.name)
                    .ok_or(MalformedReason::UnknownPseudoHeader)?;
                if slot.is_some() {
                    return Err(MalformedReason::DuplicatePseudoHeader);
                }
                *slot = Some(field.value);
            } else {
                saw_regular = true;
                section.headers.fields.push(field);
            }
        }
        Ok(section)
    }

    /// Flatten into wire order: pseudo-headers first.
    pub fn to_fields(&self) -> Vec<HeaderField> {
        let pseudo = [
            (":method", &self.pseudo.method),
            (":protocol", &self.pseudo.protocol),
            (":scheme", &self.pseudo.scheme),
            (":authority", &self.pseudo.authority),
            (":path", &self.pseudo.path),
            (":status", &self.pseudo.status),
        ];
        let mut fields: Vec<HeaderField> = pseudo
            .iter()
            .filter_map(|(name, value)| value.as_ref().map(|v| HeaderField::new(*name, v.clone())))
            .collect();
        fields.extend(self.headers.iter().cloned());
        fields
    }

    /// Check the pseudo-header rules for a request.
    ///
    /// Every request needs `:method`. CONNECT needs `:authority`; extended
    /// CONNECT (with `:protocol`) and every other method also need `:scheme`
    /// and `:path`, and either `:authority` or a `Host` header.
    pub fn validate_request(&self) -> Result<(), MalformedReason> {
        let method = self
            .pseudo
            .method
            .as_deref()
            .ok_or(MalformedReason::MissingMethod)?;
        if method == "CONNECT" && self.pseudo.protocol.is_none() {
            if self.pseudo.authority.is_none() {
                return Err(MalformedReason::MissingAuthority);
            }
            return Ok(());
        }
        if self.pseudo.scheme.is_none() {
            return Err(MalformedReason::MissingScheme);
        }
        if self.pseudo.path.is_none() {
            return Err(MalformedReason::MissingPath);
        }
        if self.pseudo.authority.is_none() && !self.headers.contains("host") {
            return Err(MalformedReason::MissingAuthority);
        }
        Ok(())
    }
}
