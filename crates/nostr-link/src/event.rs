use nostr::{Event, EventBuilder, Keys, Kind, Tag, TagKind, Timestamp};
use thiserror::Error;

/// Discovery event advertising a reachable address for a pubkey.
pub const KIND_DISCOVERY: u16 = 30166;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid event: {0}")]
    Invalid(String),

    #[error("failed to sign event: {0}")]
    Sign(String),
}

pub fn discovery_kind() -> Kind {
    Kind::from(KIND_DISCOVERY)
}

/// A `[name, value]` tag.
pub fn tag(name: &str, value: impl Into<String>) -> Tag {
    Tag::custom(TagKind::custom(name.to_string()), [value.into()])
}

/// Build and sign an event with an explicit timestamp.
pub fn sign_event(
    keys: &Keys,
    kind: Kind,
    tags: Vec<Tag>,
    content: impl Into<String>,
    created_at: u64,
) -> Result<Event, EventError> {
    EventBuilder::new(kind, content.into())
        .tags(tags)
        .custom_created_at(Timestamp::from(created_at))
        .sign_with_keys(keys)
        .map_err(|err| EventError::Sign(err.to_string()))
}

/// Parse an event from a JSON value (as found inside relay frames) and check
/// its id and signature.
pub fn verified_from_value(value: serde_json::Value) -> Result<Event, EventError> {
    let event: Event = serde_json::from_value(value)?;
    event
        .verify()
        .map_err(|err| EventError::Invalid(err.to_string()))?;
    Ok(event)
}

/// Tag access by name.
pub trait TagLookup {
    /// First value of the first tag named `name`.
    fn tag_value<'a>(&'a self, name: &'a str) -> Option<&'a str>;

    /// First values of every tag named `name`.
    fn tag_values<'a>(&'a self, name: &'a str) -> Box<dyn Iterator<Item = &'a str> + 'a>;

    /// Parameterized-replaceable events are identified by author, kind and
    /// `d` tag.
    fn is_parameterized_replaceable(&self) -> bool;
}

impl TagLookup for Event {
    fn tag_value<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.tag_values(name).next()
    }

    fn tag_values<'a>(&'a self, name: &'a str) -> Box<dyn Iterator<Item = &'a str> + 'a> {
        Box::new(self.tags.iter().filter_map(move |tag| match tag.as_slice() {
            [kind, value, ..] if kind == name => Some(value.as_str()),
            _ => None,
        }))
    }

    fn is_parameterized_replaceable(&self) -> bool {
        (30000..40000).contains(&self.kind.as_u16())
    }
}
