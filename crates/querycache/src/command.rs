use crate::policy::CachePolicy;
use querycache_core::DbParameter;

/// What the host hands over before a command runs.
#[derive(Debug, Clone, Default)]
pub struct DbCommand {
    pub text: String,
    pub parameters: Vec<DbParameter>,
    /// Connection string or any stable identity of the target database.
    pub connection_identity: String,
    /// Type token of the context that owns the command, e.g. its type name.
    pub owner: String,
    pub is_explicit_transaction: bool,
    /// Policy passed alongside the command; takes precedence over a text marker.
    pub policy: Option<CachePolicy>,
}

impl DbCommand {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_parameter(mut self, parameter: DbParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_parameters(mut self, parameters: impl IntoIterator<Item = DbParameter>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    pub fn with_connection(mut self, connection_identity: impl Into<String>) -> Self {
        self.connection_identity = connection_identity.into();
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn in_explicit_transaction(mut self, value: bool) -> Self {
        self.is_explicit_transaction = value;
        self
    }
}
