//! Strongly-typed Discord snowflakes used as keys throughout the pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use twilight_model::id::marker::{ChannelMarker, GuildMarker, UserMarker};
use twilight_model::id::Id;

use crate::error::Error;

macro_rules! snowflake {
    ($(#[$meta:meta])* $name:ident, $marker:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }

            /// Twilight ids cannot be zero, so the conversion is fallible.
            pub fn to_twilight(self) -> Result<Id<$marker>, Error> {
                Id::new_checked(self.0).ok_or_else(|| {
                    Error::Parse(format!("{} cannot be zero", stringify!($name)))
                })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim()
                    .parse::<u64>()
                    .map($name)
                    .map_err(|e| Error::Parse(format!("invalid {} '{s}': {e}", stringify!($name))))
            }
        }

        impl From<Id<$marker>> for $name {
            fn from(id: Id<$marker>) -> Self {
                $name(id.get())
            }
        }
    };
}

snowflake!(
    /// Key of the per-guild playback registry.
    GuildId,
    GuildMarker
);
snowflake!(ChannelId, ChannelMarker);
snowflake!(UserId, UserMarker);
