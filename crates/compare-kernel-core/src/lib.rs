use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Largest number of vehicles a selection may hold.
pub const MAX_SELECTION: usize = 4;
/// Smallest selection that supports a comparison.
pub const MIN_COMPARISON: usize = 2;
pub const MAX_IDENTIFIER_LEN: usize = 64;
pub const DEFAULT_SELECTION_PARAM: &str = "ids";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SelectionError {
    #[error("selection is full: at most {max} vehicles can be compared")]
    CapacityExceeded { max: usize },
    #[error("vehicle {0} is already selected")]
    DuplicateMember(Identifier),
    #[error("comparison needs at least {min} vehicles, {actual} selected")]
    InsufficientMembers { min: usize, actual: usize },
    #[error("invalid identifier {raw:?}: {reason}")]
    InvalidIdentifier { raw: String, reason: &'static str },
}

impl SelectionError {
    /// Stable advisory code for presentation layers.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::DuplicateMember(_) => "DUPLICATE_MEMBER",
            Self::InsufficientMembers { .. } => "INSUFFICIENT_MEMBERS",
            Self::InvalidIdentifier { .. } => "INVALID_IDENTIFIER",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FetchError {
    #[error("vehicle {0} was not found")]
    NotFound(Identifier),
    #[error("record store answered with status {0}")]
    Status(u16),
    #[error("record store request failed: {0}")]
    Transport(String),
    #[error("record fetch timed out")]
    Timeout,
    #[error("record payload is malformed: {0}")]
    Malformed(String),
}

impl FetchError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        "RECORD_FETCH_FAILURE"
    }
}

/// Opaque key naming one comparable vehicle.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "RawIdentifier", into = "String")]
pub struct Identifier(String);

/// Wire form of an identifier: record stores and legacy slots emit either strings or integers.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawIdentifier {
    Text(String),
    Unsigned(u64),
    Signed(i64),
}

impl Identifier {
    /// Parse one identifier from its textual form.
    ///
    /// # Errors
    /// Returns [`SelectionError::InvalidIdentifier`] when the trimmed input is empty, longer than
    /// [`MAX_IDENTIFIER_LEN`], contains characters outside `[A-Za-z0-9._-]`, or has no letter or
    /// digit at all (`..` would otherwise escape record-store paths).
    pub fn parse(raw: &str) -> Result<Self, SelectionError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SelectionError::InvalidIdentifier {
                raw: raw.to_string(),
                reason: "identifier MUST be non-empty",
            });
        }

        if trimmed.len() > MAX_IDENTIFIER_LEN {
            return Err(SelectionError::InvalidIdentifier {
                raw: raw.to_string(),
                reason: "identifier MUST be at most 64 bytes",
            });
        }

        if !trimmed.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
            return Err(SelectionError::InvalidIdentifier {
                raw: raw.to_string(),
                reason: "identifier MUST only contain ASCII letters, digits, '-', '_' or '.'",
            });
        }

        if !trimmed.chars().any(|c| c.is_ascii_alphanumeric()) {
            return Err(SelectionError::InvalidIdentifier {
                raw: raw.to_string(),
                reason: "identifier MUST contain at least one letter or digit",
            });
        }

        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for Identifier {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl TryFrom<String> for Identifier {
    type Error = SelectionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<RawIdentifier> for Identifier {
    type Error = SelectionError;

    fn try_from(value: RawIdentifier) -> Result<Self, Self::Error> {
        match value {
            RawIdentifier::Text(raw) => Self::parse(&raw),
            RawIdentifier::Unsigned(number) => Ok(Self::from(number)),
            RawIdentifier::Signed(number) => Self::parse(&number.to_string()),
        }
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.0
    }
}

impl FromStr for Identifier {
    type Err = SelectionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered, capacity-bounded, duplicate-free list of selected vehicles.
///
/// Insertion order is preserved: the first vehicle added sits at index 0.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(from = "Vec<Identifier>", into = "Vec<Identifier>")]
pub struct SelectionSet {
    ids: Vec<Identifier>,
}

/// Result of forcing an arbitrary candidate list into a valid [`SelectionSet`].
#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct Normalized {
    pub selection: SelectionSet,
    pub duplicates: Vec<Identifier>,
    pub overflow: Vec<Identifier>,
}

impl Normalized {
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.duplicates.len() + self.overflow.len()
    }
}

impl SelectionSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the first occurrence of every identifier and at most [`MAX_SELECTION`] entries.
    #[must_use]
    pub fn normalize<I>(candidates: I) -> Normalized
    where
        I: IntoIterator<Item = Identifier>,
    {
        let mut normalized = Normalized::default();
        for id in candidates {
            if normalized.selection.contains(&id) {
                normalized.duplicates.push(id);
            } else if normalized.selection.is_full() {
                normalized.overflow.push(id);
            } else {
                normalized.selection.ids.push(id);
            }
        }
        normalized
    }

    /// Append one identifier.
    ///
    /// # Errors
    /// Returns [`SelectionError::CapacityExceeded`] when the selection is full, or
    /// [`SelectionError::DuplicateMember`] when `id` is already selected. The selection is left
    /// untouched in both cases.
    pub fn try_add(&mut self, id: Identifier) -> Result<(), SelectionError> {
        if self.is_full() {
            return Err(SelectionError::CapacityExceeded { max: MAX_SELECTION });
        }
        if self.contains(&id) {
            return Err(SelectionError::DuplicateMember(id));
        }
        self.ids.push(id);
        Ok(())
    }

    /// Remove `id`, reporting whether anything changed.
    pub fn remove(&mut self, id: &Identifier) -> bool {
        let before = self.ids.len();
        self.ids.retain(|member| member != id);
        self.ids.len() != before
    }

    pub fn clear(&mut self) -> bool {
        let changed = !self.ids.is_empty();
        self.ids.clear();
        changed
    }

    #[must_use]
    pub fn contains(&self, id: &Identifier) -> bool {
        self.ids.contains(id)
    }

    #[must_use]
    pub fn position(&self, id: &Identifier) -> Option<usize> {
        self.ids.iter().position(|member| member == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.ids.len() >= MAX_SELECTION
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Identifier] {
        &self.ids
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Identifier> {
        self.ids.iter()
    }

    /// Guard for comparison actions.
    ///
    /// # Errors
    /// Returns [`SelectionError::InsufficientMembers`] below [`MIN_COMPARISON`] members.
    pub fn ensure_comparable(&self) -> Result<(), SelectionError> {
        if self.ids.len() < MIN_COMPARISON {
            return Err(SelectionError::InsufficientMembers {
                min: MIN_COMPARISON,
                actual: self.ids.len(),
            });
        }
        Ok(())
    }
}

impl From<Vec<Identifier>> for SelectionSet {
    fn from(value: Vec<Identifier>) -> Self {
        Self::normalize(value).selection
    }
}

impl From<SelectionSet> for Vec<Identifier> {
    fn from(value: SelectionSet) -> Self {
        value.ids
    }
}

impl<'a> IntoIterator for &'a SelectionSet {
    type Item = &'a Identifier;
    type IntoIter = std::slice::Iter<'a, Identifier>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}

/// Selection recovered from the durable slot.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Hydrated {
    pub selection: SelectionSet,
    pub malformed: bool,
    pub discarded: usize,
}

/// Serialize a selection for the durable slot as a JSON array of strings.
#[must_use]
pub fn encode_persisted(selection: &SelectionSet) -> String {
    Value::Array(selection.iter().map(|id| Value::String(id.to_string())).collect()).to_string()
}

/// Recover a selection from raw slot content.
///
/// Anything that is not a JSON array decodes to an empty selection. Array entries that are
/// neither valid identifier strings nor integers are skipped, then duplicates and overflow are
/// dropped keeping first-seen order.
#[must_use]
pub fn decode_persisted(raw: &str) -> Hydrated {
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) else {
        return Hydrated { selection: SelectionSet::new(), malformed: true, discarded: 0 };
    };

    let mut rejected = 0_usize;
    let mut candidates = Vec::with_capacity(items.len());
    for item in &items {
        match identifier_from_json(item) {
            Some(id) => candidates.push(id),
            None => rejected += 1,
        }
    }

    let normalized = SelectionSet::normalize(candidates);
    let discarded = rejected + normalized.dropped();
    Hydrated { selection: normalized.selection, malformed: discarded > 0, discarded }
}

fn identifier_from_json(value: &Value) -> Option<Identifier> {
    Identifier::deserialize(value).ok()
}

/// A URL-embeddable address: path, ordered query parameters and fragment.
///
/// Only the selection parameter is ever rewritten; everything else round-trips untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ShareableAddress {
    pub path: String,
    pub params: Vec<(String, String)>,
    pub fragment: Option<String>,
}

impl ShareableAddress {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let (rest, fragment) = match raw.split_once('#') {
            Some((rest, fragment)) => (rest, Some(fragment.to_string())),
            None => (raw, None),
        };
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
        let params = url::form_urlencoded::parse(query.as_bytes())
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        Self { path: path.to_string(), params, fragment }
    }

    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }

    /// Set or drop parameter `name`, keeping the position of its first occurrence.
    #[must_use]
    pub fn with_param(mut self, name: &str, value: Option<String>) -> Self {
        let position = self.params.iter().position(|(key, _)| key == name);
        self.params.retain(|(key, _)| key != name);
        if let Some(value) = value {
            let entry = (name.to_string(), value);
            match position {
                Some(index) => self.params.insert(index, entry),
                None => self.params.push(entry),
            }
        }
        self
    }

    /// Candidate identifiers carried by parameter `name`; `None` when the parameter is absent.
    #[must_use]
    pub fn selection(&self, name: &str) -> Option<Vec<Identifier>> {
        self.param(name).map(parse_selection_value)
    }
}

impl Display for ShareableAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path)?;
        for (index, (key, value)) in self.params.iter().enumerate() {
            f.write_str(if index == 0 { "?" } else { "&" })?;
            write!(f, "{}={}", encode_component(key), encode_component(value))?;
        }
        if let Some(fragment) = &self.fragment {
            write!(f, "#{fragment}")?;
        }
        Ok(())
    }
}

// Commas are legal in a query component and keep shared links readable.
fn encode_component(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect::<String>().replace("%2C", ",")
}

/// Comma-joined selection, or `None` for an empty selection.
#[must_use]
pub fn selection_value(selection: &SelectionSet) -> Option<String> {
    if selection.is_empty() {
        return None;
    }
    Some(selection.iter().map(Identifier::as_str).collect::<Vec<_>>().join(","))
}

/// Split a comma-joined list, silently dropping empty or invalid tokens.
///
/// Neither capacity nor uniqueness is enforced here.
#[must_use]
pub fn parse_selection_value(value: &str) -> Vec<Identifier> {
    value.split(',').filter_map(|token| Identifier::parse(token).ok()).collect()
}

#[must_use]
pub fn to_address(
    selection: &SelectionSet,
    base: &ShareableAddress,
    param: &str,
) -> ShareableAddress {
    base.clone().with_param(param, selection_value(selection))
}

#[must_use]
pub fn from_address(address: &str, param: &str) -> Option<Vec<Identifier>> {
    ShareableAddress::parse(address).selection(param)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StartupSource {
    Persisted,
    Address,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct Reconciliation {
    pub source: StartupSource,
    pub selection: SelectionSet,
    pub dropped: Vec<Identifier>,
}

/// Decide which selection a session starts with.
///
/// A non-empty address candidate that differs from the persisted selection wins; an absent or
/// empty candidate keeps the persisted selection.
#[must_use]
pub fn reconcile_startup(
    persisted: &SelectionSet,
    candidate: Option<Vec<Identifier>>,
) -> Reconciliation {
    let keep = || Reconciliation {
        source: StartupSource::Persisted,
        selection: persisted.clone(),
        dropped: Vec::new(),
    };

    let Some(candidate) = candidate.filter(|ids| !ids.is_empty()) else {
        return keep();
    };

    let normalized = SelectionSet::normalize(candidate);
    if normalized.selection == *persisted {
        return keep();
    }

    let mut dropped = normalized.duplicates;
    dropped.extend(normalized.overflow);
    Reconciliation { source: StartupSource::Address, selection: normalized.selection, dropped }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PriceMode {
    Periodic,
    OneTime,
}

impl PriceMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Periodic => "periodic",
            Self::OneTime => "one_time",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct ActivePrice {
    pub mode: PriceMode,
    pub amount: f64,
}

/// Pricing facet of a vehicle record. Exactly one mode must be populated.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PricingFacet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub periodic_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_price: Option<f64>,
}

impl PricingFacet {
    #[must_use]
    pub fn periodic(amount: f64) -> Self {
        Self { periodic_price: Some(amount), one_time_price: None }
    }

    #[must_use]
    pub fn one_time(amount: f64) -> Self {
        Self { periodic_price: None, one_time_price: Some(amount) }
    }

    /// The single price used for comparison.
    ///
    /// `None` when no mode or both modes are populated, or when the amount is negative or not
    /// finite.
    #[must_use]
    pub fn active_price(&self) -> Option<ActivePrice> {
        let (mode, amount) = match (self.periodic_price, self.one_time_price) {
            (Some(amount), None) => (PriceMode::Periodic, amount),
            (None, Some(amount)) => (PriceMode::OneTime, amount),
            _ => return None,
        };
        (amount.is_finite() && amount >= 0.0).then_some(ActivePrice { mode, amount })
    }
}

/// Full record for one vehicle as returned by the remote record store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VehicleRecord {
    pub id: Identifier,
    #[serde(default)]
    pub pricing: PricingFacet,
    #[serde(default)]
    pub display: Value,
}

/// Index of the first record with the lowest active price.
///
/// Returns `None` for fewer than [`MIN_COMPARISON`] records or when no record carries a usable
/// price. Records without one are skipped rather than treated as free.
#[must_use]
pub fn best_value_index(records: &[VehicleRecord]) -> Option<usize> {
    if records.len() < MIN_COMPARISON {
        return None;
    }

    let mut best: Option<(usize, f64)> = None;
    for (index, record) in records.iter().enumerate() {
        let Some(price) = record.pricing.active_price() else {
            continue;
        };
        let improves = match best {
            Some((_, amount)) => price.amount.total_cmp(&amount) == Ordering::Less,
            None => true,
        };
        if improves {
            best = Some((index, price.amount));
        }
    }

    best.map(|(index, _)| index)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    Resolved,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheEntry {
    Pending,
    Resolved(VehicleRecord),
    Failed(FetchError),
}

impl CacheEntry {
    #[must_use]
    pub fn state(&self) -> EntryState {
        match self {
            Self::Pending => EntryState::Pending,
            Self::Resolved(_) => EntryState::Resolved,
            Self::Failed(_) => EntryState::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Settlement {
    /// The outcome was written to the cache.
    Applied,
    /// The identifier is no longer tracked; the outcome was discarded.
    Stale,
    /// A failure arrived for an already resolved identifier and was ignored.
    Kept,
}

/// Per-identifier resolution state, keyed by identifier.
///
/// Entries move `absent -> pending -> resolved | failed`, `failed -> pending` on retry, and back
/// to absent when evicted.
#[derive(Debug, Clone, Default)]
pub struct ResolvedCache {
    entries: BTreeMap<Identifier, CacheEntry>,
}

impl ResolvedCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry whose identifier is not in `selection`, returning the evicted ids.
    pub fn retain_selection(&mut self, selection: &SelectionSet) -> Vec<Identifier> {
        let evicted = self
            .entries
            .keys()
            .filter(|id| !selection.contains(id))
            .cloned()
            .collect::<Vec<_>>();
        for id in &evicted {
            self.entries.remove(id);
        }
        evicted
    }

    pub fn evict(&mut self, id: &Identifier) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Mark `id` pending unless it is already resolved. Returns whether a fetch is needed.
    pub fn begin(&mut self, id: &Identifier) -> bool {
        if matches!(self.entries.get(id), Some(CacheEntry::Resolved(_))) {
            return false;
        }
        self.entries.insert(id.clone(), CacheEntry::Pending);
        true
    }

    pub fn settle(
        &mut self,
        id: &Identifier,
        outcome: Result<VehicleRecord, FetchError>,
    ) -> Settlement {
        let Some(entry) = self.entries.get_mut(id) else {
            return Settlement::Stale;
        };

        match outcome {
            Ok(record) => *entry = CacheEntry::Resolved(record),
            Err(_) if matches!(entry, CacheEntry::Resolved(_)) => return Settlement::Kept,
            Err(err) => *entry = CacheEntry::Failed(err),
        }
        Settlement::Applied
    }

    #[must_use]
    pub fn entry(&self, id: &Identifier) -> Option<&CacheEntry> {
        self.entries.get(id)
    }

    #[must_use]
    pub fn state(&self, id: &Identifier) -> Option<EntryState> {
        self.entries.get(id).map(CacheEntry::state)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Settled view of `selection`, in selection order. Untracked or pending ids are omitted.
    #[must_use]
    pub fn consolidate(&self, selection: &SelectionSet) -> Resolution {
        let mut resolution = Resolution::default();
        for id in selection {
            match self.entries.get(id) {
                Some(CacheEntry::Resolved(record)) => resolution.resolved.push(record.clone()),
                Some(CacheEntry::Failed(err)) => {
                    resolution.failed_ids.push(id.clone());
                    resolution.failures.insert(id.clone(), err.clone());
                }
                Some(CacheEntry::Pending) | None => {}
            }
        }
        resolution
    }
}

/// Consolidated outcome of resolving one selection.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Resolution {
    pub resolved: Vec<VehicleRecord>,
    pub failed_ids: Vec<Identifier>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub failures: BTreeMap<Identifier, FetchError>,
}

impl Resolution {
    #[must_use]
    pub fn best_value_index(&self) -> Option<usize> {
        best_value_index(&self.resolved)
    }

    #[must_use]
    pub fn best_value(&self) -> Option<&VehicleRecord> {
        self.best_value_index().and_then(|index| self.resolved.get(index))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Comparison {
    #[serde(flatten)]
    pub resolution: Resolution,
    pub best_value_index: Option<usize>,
}

impl From<Resolution> for Comparison {
    fn from(resolution: Resolution) -> Self {
        let best_value_index = resolution.best_value_index();
        Self { resolution, best_value_index }
    }
}
