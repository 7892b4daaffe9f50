//! Request path templates.
//!
//! A [`Path`] holds a template such as `/property/:property_id` and renders it with
//! an optional origin, a prefix, substituted `:name` parameters and a sorted query
//! string.

use std::{collections::BTreeMap, fmt};

use url::form_urlencoded;

const SCHEME_SEPARATOR: &str = "://";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Path {
    base_url: String,
    prefix: String,
    template: String,
    params: BTreeMap<String, String>,
    query: BTreeMap<String, Vec<String>>,
}

impl Path {
    /// Parses `template`. An origin (`https://host:port`) and a query string in the
    /// template are split off and kept.
    pub fn new(template: impl AsRef<str>) -> Self {
        let template = template.as_ref();
        let (template, raw_query) = match template.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (template, None),
        };
        let (base_url, template) = split_origin(template);

        let mut path = Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            template: template.to_string(),
            ..Self::default()
        };
        if let Some(raw_query) = raw_query {
            for (key, value) in form_urlencoded::parse(raw_query.as_bytes()) {
                path = path.with_query(key, [value]);
            }
        }
        path
    }

    /// Replaces the origin. An origin already present in the template is dropped.
    pub fn with_base_url(mut self, base_url: impl AsRef<str>) -> Self {
        let base_url = base_url.as_ref().trim_end_matches('/');
        if !base_url.is_empty() {
            self.base_url = base_url.to_string();
        }
        self
    }

    /// Segments placed between the origin and the template, e.g. `v1`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Substitutes the `:name` segment. `name` may be given with or without the colon.
    /// The value is percent-encoded as a single segment.
    pub fn with_param(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        let name = name.as_ref();
        let name = name.strip_prefix(':').unwrap_or(name);
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn with_params<K, V>(self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        params
            .into_iter()
            .fold(self, |path, (name, value)| path.with_param(name, value))
    }

    /// Appends values to a query key. Empty values are skipped; a key given no values
    /// at all is still rendered, as `key=`.
    pub fn with_query<K, V>(mut self, key: K, values: impl IntoIterator<Item = V>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let key = key.into();
        let mut values = values.into_iter().map(Into::<String>::into).peekable();
        if values.peek().is_none() {
            self.query.entry(key).or_default();
            return self;
        }

        let values: Vec<String> = values.filter(|value| !value.is_empty()).collect();
        if !values.is_empty() {
            self.query.entry(key).or_default().extend(values);
        }
        self
    }

    /// One value per key.
    pub fn with_query_args<K, V>(self, args: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        args.into_iter()
            .fold(self, |path, (key, value)| path.with_query(key, [value]))
    }

    fn write_segments(&self, f: &mut fmt::Formatter<'_>) -> Result<bool, fmt::Error> {
        let mut written = false;
        let segments = self
            .prefix
            .split('/')
            .chain(self.template.split('/'))
            .filter(|segment| !segment.is_empty());
        for segment in segments {
            f.write_str("/")?;
            let param = segment
                .strip_prefix(':')
                .and_then(|name| self.params.get(name));
            match param {
                Some(value) => f.write_str(&encode_segment(value))?,
                None => f.write_str(segment)?,
            }
            written = true;
        }
        Ok(written)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_url)?;
        if !self.write_segments(f)? && self.base_url.is_empty() {
            f.write_str("/")?;
        }

        if !self.query.is_empty() {
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            for (key, values) in &self.query {
                if values.is_empty() {
                    serializer.append_pair(key, "");
                }
                for value in values {
                    serializer.append_pair(key, value);
                }
            }
            write!(f, "?{}", serializer.finish())?;
        }
        Ok(())
    }
}

impl From<&str> for Path {
    fn from(template: &str) -> Self {
        Self::new(template)
    }
}

fn split_origin(template: &str) -> (&str, &str) {
    let Some(scheme_end) = template.find(SCHEME_SEPARATOR) else {
        return ("", template);
    };
    let host_start = scheme_end + SCHEME_SEPARATOR.len();
    match template[host_start..].find('/') {
        Some(offset) => template.split_at(host_start + offset),
        None => (template, ""),
    }
}

// Form encoding turns spaces into `+`, which a path would keep literally.
fn encode_segment(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}
