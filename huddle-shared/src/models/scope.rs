use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Privilege level a subject holds on a chat group or chat thread.
///
/// Variants are declared in ascending privilege order so the derived `Ord`
/// is the lattice ordering `Traverse < Access < Manage`, and combining
/// candidate scopes is a plain `max`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    /// Sees that a chat group exists without reading any of its threads.
    Traverse,
    /// Reads the contents of the resource.
    Access,
    /// Administers the resource; on a group it implies access to every thread.
    Manage,
}

impl Scope {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Traverse => "TRAVERSE",
            Self::Access => "ACCESS",
            Self::Manage => "MANAGE",
        }
    }

    /// Whether this scope entitles the holder to read thread contents.
    #[must_use]
    pub fn grants_read(self) -> bool {
        self >= Self::Access
    }

    /// Thread grants only carry `ACCESS` or `MANAGE`.
    #[must_use]
    pub const fn allowed_on_thread(self) -> bool {
        !matches!(self, Self::Traverse)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Scope {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_uppercase().as_str() {
            "TRAVERSE" => Ok(Self::Traverse),
            "ACCESS" => Ok(Self::Access),
            "MANAGE" => Ok(Self::Manage),
            _ => Err("invalid permission scope"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_privilege() {
        assert!(Scope::Traverse < Scope::Access);
        assert!(Scope::Access < Scope::Manage);
        assert_eq!(
            [Scope::Access, Scope::Manage, Scope::Traverse]
                .into_iter()
                .max(),
            Some(Scope::Manage)
        );
    }

    #[test]
    fn absent_scope_sorts_below_every_grant() {
        let none: Option<Scope> = None;
        assert_eq!(none.max(Some(Scope::Traverse)), Some(Scope::Traverse));
        assert_eq!(Some(Scope::Access).max(none), Some(Scope::Access));
    }

    #[test]
    fn only_access_and_manage_read() {
        assert!(!Scope::Traverse.grants_read());
        assert!(Scope::Access.grants_read());
        assert!(Scope::Manage.grants_read());
        assert!(!Scope::Traverse.allowed_on_thread());
    }

    #[test]
    fn parses_case_insensitively_and_serializes_upper() {
        assert_eq!(Scope::try_from("manage"), Ok(Scope::Manage));
        assert_eq!(Scope::try_from(" ACCESS "), Ok(Scope::Access));
        assert!(Scope::try_from("owner").is_err());
        assert_eq!(
            serde_json::to_string(&Scope::Traverse).unwrap(),
            "\"TRAVERSE\""
        );
    }
}
