use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use ulid::{DecodeError, Ulid};

/// Correlation id of a single dispatch.
///
/// Every `send`/`send_async` call gets one so that the lookup, execution and
/// completion log lines of a dispatch can be tied together, even when the
/// handler runs on a worker coroutine. Ids are ULIDs, so they sort by the
/// millisecond they were issued in and travel as their 26-character text form.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct DispatchId(Ulid);

impl DispatchId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// When the dispatch started, to millisecond precision.
    #[must_use]
    pub fn issued_at(&self) -> SystemTime {
        self.0.datetime()
    }
}

impl Default for DispatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Ulid> for DispatchId {
    fn from(id: Ulid) -> Self {
        Self(id)
    }
}

impl fmt::Display for DispatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for DispatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DispatchId({})", self.0)
    }
}

impl FromStr for DispatchId {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

impl From<DispatchId> for String {
    fn from(id: DispatchId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for DispatchId {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
