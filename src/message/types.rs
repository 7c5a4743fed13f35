//! Domain newtypes for the message layer.

use nutype::nutype;
use uuid::Uuid;

/// Dot-delimited topic string naming a request, response, or event.
///
/// The portion before the first `.` is the service name. Must be non-empty
/// and contain only printable bytes (spec.md §4.1).
#[nutype(
    sanitize(trim),
    validate(predicate = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_graphic())),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into, AsRef)
)]
pub struct Topic(String);

impl Topic {
    /// Returns the service prefix (the portion before the first `.`), or
    /// `None` if the topic has no `.` separator.
    #[must_use]
    pub fn service(&self) -> Option<&str> {
        self.as_ref().split_once('.').map(|(service, _)| service)
    }
}

/// Identity frame used in a message's routing stack: a rank's link identity
/// or a module's UUID string.
#[nutype(
    validate(len_char_min = 1),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into, AsRef)
)]
pub struct Identity(String);

/// Unique identifier for a message, used for correlation and in-flight tables.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}
