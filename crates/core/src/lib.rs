#![forbid(unsafe_code)]

pub mod geom;
pub mod state;

pub mod ids {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ProjectId(i64);

    impl ProjectId {
        pub fn get(self) -> i64 {
            self.0
        }

        pub fn try_new(value: i64) -> Result<Self, IdError> {
            if value <= 0 {
                return Err(IdError::NotPositive);
            }
            Ok(Self(value))
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct UserId(i64);

    impl UserId {
        pub fn get(self) -> i64 {
            self.0
        }

        pub fn try_new(value: i64) -> Result<Self, IdError> {
            if value <= 0 {
                return Err(IdError::NotPositive);
            }
            Ok(Self(value))
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum IdError {
        NotPositive,
    }

    impl IdError {
        pub fn message(&self) -> &'static str {
            match self {
                Self::NotPositive => "id must be a positive integer",
            }
        }
    }
}

pub mod model {
    /// Confidence of an edge or link, 1 (lowest) to 5 (highest).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Confidence(u8);

    pub const DEFAULT_CONFIDENCE: Confidence = Confidence(5);

    /// Radius value meaning "not measured".
    pub const UNSET_RADIUS: f64 = -1.0;

    impl Confidence {
        pub fn get(self) -> u8 {
            self.0
        }

        pub fn try_new(value: i64) -> Result<Self, ConfidenceError> {
            if !(1..=5).contains(&value) {
                return Err(ConfidenceError::OutOfRange);
            }
            Ok(Self(value as u8))
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum ConfidenceError {
        OutOfRange,
    }

    impl ConfidenceError {
        pub fn message(&self) -> &'static str {
            match self {
                Self::OutOfRange => "confidence must be between 1 and 5",
            }
        }
    }

    /// Closed set of treenode-connector relations.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum RelationKind {
        PresynapticTo,
        PostsynapticTo,
        Abutting,
        GapJunction,
    }

    impl RelationKind {
        pub fn as_str(self) -> &'static str {
            match self {
                Self::PresynapticTo => "presynaptic_to",
                Self::PostsynapticTo => "postsynaptic_to",
                Self::Abutting => "abutting",
                Self::GapJunction => "gap_junction",
            }
        }

        pub fn try_parse(value: &str) -> Result<Self, RelationError> {
            match value.trim() {
                "presynaptic_to" => Ok(Self::PresynapticTo),
                "postsynaptic_to" => Ok(Self::PostsynapticTo),
                "abutting" => Ok(Self::Abutting),
                "gap_junction" => Ok(Self::GapJunction),
                _ => Err(RelationError::Unknown),
            }
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum RelationError {
        Unknown,
    }

    impl RelationError {
        pub fn message(&self) -> &'static str {
            match self {
                Self::Unknown => "unknown relation kind",
            }
        }
    }

    /// Project roles. Each role implies the ones below it.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum Role {
        Browse,
        Annotate,
        Admin,
    }

    impl Role {
        pub fn as_str(self) -> &'static str {
            match self {
                Self::Browse => "browse",
                Self::Annotate => "annotate",
                Self::Admin => "admin",
            }
        }

        pub fn try_parse(value: &str) -> Result<Self, RoleError> {
            match value.trim() {
                "browse" => Ok(Self::Browse),
                "annotate" => Ok(Self::Annotate),
                "admin" => Ok(Self::Admin),
                _ => Err(RoleError::Unknown),
            }
        }

        fn rank(self) -> u8 {
            match self {
                Self::Browse => 0,
                Self::Annotate => 1,
                Self::Admin => 2,
            }
        }

        pub fn covers(self, required: Role) -> bool {
            self.rank() >= required.rank()
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum RoleError {
        Unknown,
    }

    impl RoleError {
        pub fn message(&self) -> &'static str {
            match self {
                Self::Unknown => "unknown role",
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn confidence_bounds() {
            assert!(Confidence::try_new(0).is_err());
            assert!(Confidence::try_new(6).is_err());
            assert_eq!(Confidence::try_new(3).map(Confidence::get), Ok(3));
        }

        #[test]
        fn relation_round_trip() {
            for kind in [
                RelationKind::PresynapticTo,
                RelationKind::PostsynapticTo,
                RelationKind::Abutting,
                RelationKind::GapJunction,
            ] {
                assert_eq!(RelationKind::try_parse(kind.as_str()), Ok(kind));
            }
            assert!(RelationKind::try_parse("synapse").is_err());
        }

        #[test]
        fn role_coverage() {
            assert!(Role::Admin.covers(Role::Browse));
            assert!(Role::Annotate.covers(Role::Annotate));
            assert!(!Role::Browse.covers(Role::Annotate));
        }
    }
}
