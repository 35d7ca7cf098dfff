macro_rules! define_id {
    ($name:ident) => {
        /// Typed wrapper around a UUID v7 identifier.
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub uuid::Uuid);

        #[allow(clippy::new_without_default)]
        impl $name {
            /// Generate a new time-sortable identifier.
            pub fn new() -> Self {
                Self(uuid::Uuid::now_v7())
            }

            /// Raw 16-byte form, used when the id is bound into signatures and AAD.
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(uuid::Uuid::parse_str(s)?))
            }
        }
    };
}

define_id!(UserId);
define_id!(ChatId);
define_id!(KeyRecordId);
