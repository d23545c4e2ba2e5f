//! Source catalog: the CSV list of road datasets, their priorities and the
//! attributes retained from each.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use shared::PROVENANCE_COLUMNS;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("cannot open catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed catalog: {0}")]
    Csv(#[from] csv::Error),
    #[error("catalog row {row}: alias `{alias}` must be a non-empty identifier")]
    InvalidAlias { row: usize, alias: String },
    #[error("alias `{0}` appears more than once")]
    DuplicateAlias(String),
    #[error("source `{alias}`: priority `{value}` is not a non-negative integer")]
    InvalidPriority { alias: String, value: String },
    #[error("sources `{first}` and `{second}` share priority {priority}")]
    DuplicatePriority {
        priority: u32,
        first: String,
        second: String,
    },
    #[error("source `{alias}`: missing required field `{field}`")]
    MissingField { alias: String, field: &'static str },
    #[error("source `{alias}`: unknown preprocess operation `{value}`")]
    UnknownOperation { alias: String, value: String },
    #[error("source `{alias}`: invalid query: {reason}")]
    InvalidQuery { alias: String, reason: String },
    #[error("catalog defines no prioritized sources")]
    NoSources,
}

/// Named transform applied to a source before conflation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PreprocessOperation {
    /// Table is already tiled upstream and carries a tile attribute.
    #[default]
    None,
    /// Lines are clipped to every grid tile they cross.
    Tile,
    /// Road polygons are repaired, reduced to medial lines, then tiled.
    RoadPoly2Line,
}

impl PreprocessOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            PreprocessOperation::None => "none",
            PreprocessOperation::Tile => "tile",
            PreprocessOperation::RoadPoly2Line => "roadpoly2line",
        }
    }
}

impl fmt::Display for PreprocessOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PreprocessOperation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "" | "none" => Ok(PreprocessOperation::None),
            "tile" => Ok(PreprocessOperation::Tile),
            "roadpoly2line" => Ok(PreprocessOperation::RoadPoly2Line),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Text(String),
    Number(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Eq,
    NotEq,
}

#[derive(Debug, Clone, PartialEq)]
struct Clause {
    field: String,
    comparison: Comparison,
    literal: Literal,
}

/// Conjunction of `field = literal` / `field <> literal` tests.
///
/// Follows SQL null semantics: a clause on a missing or null attribute is
/// never satisfied.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeFilter {
    clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Text(String),
    Number(f64),
    Eq,
    NotEq,
}

fn tokenize(query: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = query.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '<' | '!' => {
                chars.next();
                let next = chars.next();
                match (c, next) {
                    ('<', Some('>')) | ('!', Some('=')) => tokens.push(Token::NotEq),
                    _ => return Err(format!("unsupported operator starting with `{c}`")),
                }
            }
            '\'' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('\'') if chars.peek() == Some(&'\'') => {
                            chars.next();
                            text.push('\'');
                        }
                        Some('\'') => break,
                        Some(ch) => text.push(ch),
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::Text(text));
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let mut raw = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '-' || d == '.' || d == 'e' || d == 'E' {
                        raw.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = raw
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number `{raw}`"))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("unexpected character `{other}`")),
        }
    }
    Ok(tokens)
}

impl FromStr for AttributeFilter {
    type Err = String;

    fn from_str(query: &str) -> Result<Self, Self::Err> {
        let tokens = tokenize(query)?;
        let mut clauses = Vec::new();
        let mut rest = tokens.as_slice();
        loop {
            let (clause, remaining) = match rest {
                [Token::Ident(field), op, value, remaining @ ..] => {
                    let comparison = match op {
                        Token::Eq => Comparison::Eq,
                        Token::NotEq => Comparison::NotEq,
                        _ => return Err(format!("expected comparison after `{field}`")),
                    };
                    let literal = match value {
                        Token::Text(text) => Literal::Text(text.clone()),
                        Token::Number(number) => Literal::Number(*number),
                        _ => return Err(format!("expected literal after `{field}`")),
                    };
                    let clause = Clause {
                        field: field.to_lowercase(),
                        comparison,
                        literal,
                    };
                    (clause, remaining)
                }
                _ => return Err("expected `field = value`".to_string()),
            };
            clauses.push(clause);
            match remaining {
                [] => break,
                [Token::Ident(keyword), tail @ ..] if keyword.eq_ignore_ascii_case("and") => rest = tail,
                _ => return Err("clauses must be joined with AND".to_string()),
            }
        }
        Ok(Self { clauses })
    }
}

impl AttributeFilter {
    pub fn matches(&self, properties: &Map<String, Value>) -> bool {
        self.clauses.iter().all(|clause| {
            let Some(value) = lookup(properties, &clause.field) else {
                return false;
            };
            let equal = match (&clause.literal, value) {
                (_, Value::Null) => return false,
                (Literal::Text(expected), Value::String(actual)) => expected == actual,
                (Literal::Text(expected), other) => *expected == other.to_string(),
                (Literal::Number(expected), Value::Number(actual)) => actual.as_f64() == Some(*expected),
                (Literal::Number(expected), Value::String(actual)) => {
                    actual.trim().parse::<f64>().ok() == Some(*expected)
                }
                (Literal::Number(_), _) => false,
            };
            match clause.comparison {
                Comparison::Eq => equal,
                Comparison::NotEq => !equal,
            }
        })
    }
}

/// Case-insensitive property lookup; source tables mix `ROAD_NAME` and `road_name`.
pub fn lookup<'a>(properties: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    properties
        .get(field)
        .or_else(|| properties.iter().find(|(key, _)| key.eq_ignore_ascii_case(field)).map(|(_, v)| v))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub alias: String,
    /// `None` for auxiliary rows that are never conflated.
    pub priority: Option<u32>,
    /// Stamped into every feature as `source_name`.
    pub source_name: String,
    pub primary_key: Vec<String>,
    pub fields: Vec<String>,
    pub operation: PreprocessOperation,
    pub query: Option<AttributeFilter>,
    pub manual_download: bool,
}

impl Source {
    pub fn is_auxiliary(&self) -> bool {
        self.priority.is_none()
    }

    /// Primary key columns followed by declared fields, without repeats.
    pub fn attribute_fields(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.primary_key
            .iter()
            .chain(&self.fields)
            .filter(|field| seen.insert(field.as_str()))
            .cloned()
            .collect()
    }

    /// Attribute fields that reach the merged output.
    pub fn output_fields(&self) -> Vec<String> {
        match self.operation {
            PreprocessOperation::RoadPoly2Line => Vec::new(),
            _ => self.attribute_fields(),
        }
    }

    pub fn column_name(&self, field: &str) -> String {
        format!("{}_{}", self.alias, field).to_uppercase()
    }

    pub fn output_columns(&self) -> Vec<String> {
        self.output_fields()
            .iter()
            .map(|field| self.column_name(field))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct SourceRow {
    alias: String,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    source_table: Option<String>,
    #[serde(default)]
    primary_key: Option<String>,
    #[serde(default)]
    fields: Option<String>,
    #[serde(default)]
    preprocess_operation: Option<String>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    manual_download: Option<String>,
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|part| part.trim().to_lowercase())
        .filter(|part| !part.is_empty())
        .collect()
}

fn is_identifier(alias: &str) -> bool {
    !alias.is_empty()
        && alias.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !alias.starts_with(|c: char| c.is_ascii_digit())
}

fn parse_flag(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|v| v.trim().to_lowercase()).as_deref(),
        Some("t" | "true" | "y" | "yes" | "1")
    )
}

impl SourceRow {
    fn into_source(self, row: usize) -> Result<Source, CatalogError> {
        let alias = self.alias.trim().to_lowercase();
        if !is_identifier(&alias) {
            return Err(CatalogError::InvalidAlias {
                row,
                alias: self.alias,
            });
        }

        let priority = match self.priority.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => match raw.parse::<u32>() {
                Ok(0) => None,
                Ok(value) => Some(value),
                Err(_) => {
                    return Err(CatalogError::InvalidPriority {
                        alias,
                        value: raw.to_string(),
                    })
                }
            },
        };

        let operation = self
            .preprocess_operation
            .as_deref()
            .unwrap_or_default()
            .parse::<PreprocessOperation>()
            .map_err(|value| CatalogError::UnknownOperation {
                alias: alias.clone(),
                value,
            })?;

        let primary_key = match operation {
            PreprocessOperation::RoadPoly2Line => vec![format!("{alias}_id")],
            _ => split_list(self.primary_key.as_deref()),
        };
        if priority.is_some() && primary_key.is_empty() {
            return Err(CatalogError::MissingField {
                alias,
                field: "primary_key",
            });
        }

        let query = match self.query.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(raw.parse::<AttributeFilter>().map_err(|reason| {
                CatalogError::InvalidQuery {
                    alias: alias.clone(),
                    reason,
                }
            })?),
        };

        let source_name = self
            .source_table
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| alias.clone());

        Ok(Source {
            priority,
            source_name,
            fields: split_list(self.fields.as_deref()),
            primary_key,
            operation,
            query,
            manual_download: parse_flag(self.manual_download.as_deref()),
            alias,
        })
    }
}

/// Validated source list. Prioritized sources come first, ascending by
/// priority, followed by auxiliary rows in file order.
#[derive(Debug, Clone)]
pub struct Catalog {
    sources: Vec<Source>,
}

impl Catalog {
    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let file = File::open(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, CatalogError> {
        let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::Headers).from_reader(reader);
        let mut sources = Vec::new();
        for (index, row) in csv.deserialize::<SourceRow>().enumerate() {
            sources.push(row?.into_source(index + 1)?);
        }
        Self::new(sources)
    }

    pub fn new(mut sources: Vec<Source>) -> Result<Self, CatalogError> {
        let mut aliases = HashSet::new();
        let mut priorities: HashMap<u32, &str> = HashMap::new();
        for source in &sources {
            if !aliases.insert(source.alias.as_str()) {
                return Err(CatalogError::DuplicateAlias(source.alias.clone()));
            }
            if let Some(priority) = source.priority {
                if let Some(first) = priorities.insert(priority, &source.alias) {
                    return Err(CatalogError::DuplicatePriority {
                        priority,
                        first: first.to_string(),
                        second: source.alias.clone(),
                    });
                }
            }
        }
        if priorities.is_empty() {
            return Err(CatalogError::NoSources);
        }

        sources.sort_by_key(|source| (source.priority.is_none(), source.priority));
        Ok(Self { sources })
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    /// Prioritized sources in ascending priority.
    pub fn conflated(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter().filter(|source| !source.is_auxiliary())
    }

    pub fn get(&self, alias: &str) -> Option<&Source> {
        self.sources.iter().find(|source| source.alias == alias)
    }

    /// Every column the complete run could produce: provenance columns, then
    /// each prioritized source's columns in priority order.
    pub fn union_columns(&self) -> Vec<String> {
        PROVENANCE_COLUMNS
            .iter()
            .map(|column| column.to_string())
            .chain(self.conflated().flat_map(Source::output_columns))
            .collect()
    }
}
