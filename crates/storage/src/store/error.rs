#![forbid(unsafe_code)]

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Sql(rusqlite::Error),
    InvalidInput(&'static str),
    /// The client's state descriptor does not match the live rows. The client
    /// must refetch and retry; nothing was written.
    StaleState {
        node_id: i64,
        reason: &'static str,
    },
    /// The mutation would break a tree invariant.
    StructuralViolation {
        node_id: i64,
        constraint: &'static str,
    },
    PermissionDenied {
        user_id: i64,
        project_id: i64,
        required: &'static str,
    },
    UnknownProject {
        project_id: i64,
    },
    UnknownNode {
        node_id: i64,
    },
    UnknownConnector {
        connector_id: i64,
    },
    UnknownLink {
        link_id: i64,
    },
    UnknownSkeleton {
        skeleton_id: i64,
    },
    UnknownGrid {
        grid_id: i64,
    },
    LinkExists {
        treenode_id: i64,
        connector_id: i64,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Sql(err) => write!(f, "sqlite: {err}"),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::StaleState { node_id, reason } => {
                write!(f, "stale state for node {node_id}: {reason}")
            }
            Self::StructuralViolation {
                node_id,
                constraint,
            } => write!(
                f,
                "structural violation at node {node_id}: {constraint}"
            ),
            Self::PermissionDenied {
                user_id,
                project_id,
                required,
            } => write!(
                f,
                "user {user_id} lacks '{required}' on project {project_id}"
            ),
            Self::UnknownProject { project_id } => write!(f, "unknown project {project_id}"),
            Self::UnknownNode { node_id } => write!(f, "unknown treenode {node_id}"),
            Self::UnknownConnector { connector_id } => {
                write!(f, "unknown connector {connector_id}")
            }
            Self::UnknownLink { link_id } => write!(f, "unknown link {link_id}"),
            Self::UnknownSkeleton { skeleton_id } => {
                write!(f, "unknown skeleton {skeleton_id}")
            }
            Self::UnknownGrid { grid_id } => write!(f, "unknown grid cache {grid_id}"),
            Self::LinkExists {
                treenode_id,
                connector_id,
            } => write!(
                f,
                "link between treenode {treenode_id} and connector {connector_id} already exists"
            ),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql(value)
    }
}
