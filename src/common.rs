use bson::{Bson, Document};
use std::collections::BTreeMap;
use std::fmt;

/// Which server roles are acceptable targets for a read operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl fmt::Display for ReadMode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(match *self {
            ReadMode::Primary => "primary",
            ReadMode::PrimaryPreferred => "primaryPreferred",
            ReadMode::Secondary => "secondary",
            ReadMode::SecondaryPreferred => "secondaryPreferred",
            ReadMode::Nearest => "nearest",
        })
    }
}

/// A read routing policy: a mode, optionally narrowed by tag sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPreference {
    /// Indicates how a server should be selected during read operations.
    pub mode: ReadMode,
    /// Filters servers based on the first tag set that matches at least one server.
    pub tag_sets: Vec<BTreeMap<String, String>>,
}

impl ReadPreference {
    pub fn new(mode: ReadMode, tag_sets: Option<Vec<BTreeMap<String, String>>>) -> ReadPreference {
        ReadPreference {
            mode,
            tag_sets: tag_sets.unwrap_or_else(Vec::new),
        }
    }

    pub fn primary() -> ReadPreference {
        ReadPreference::new(ReadMode::Primary, None)
    }

    /// Reports whether a server advertising `server_tags` satisfies this
    /// preference's tag sets. An empty tag-set list matches every server.
    pub fn matches_tags(&self, server_tags: &BTreeMap<String, String>) -> bool {
        if self.tag_sets.is_empty() {
            return true;
        }

        self.tag_sets.iter().any(|set| {
            set.iter()
                .all(|(key, value)| server_tags.get(key) == Some(value))
        })
    }

    /// The `$readPreference` document form sent to shard routers.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("mode", self.mode.to_string());

        if !self.tag_sets.is_empty() {
            let tags = self
                .tag_sets
                .iter()
                .map(|set| {
                    let mut tag_doc = Document::new();
                    for (key, value) in set {
                        tag_doc.insert(key.to_owned(), value.to_owned());
                    }
                    Bson::Document(tag_doc)
                })
                .collect();
            doc.insert("tags", Bson::Array(tags));
        }

        doc
    }
}
