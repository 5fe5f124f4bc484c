//! Application property keys and operation names from the management
//! working draft

/// Key of the operation application property
pub const OPERATION: &str = "operation";

/// Key of the manageable entity type application property
pub const TYPE: &str = "type";

/// Key of the locales application property
pub const LOCALES: &str = "locales";

/// Key of the name application property
pub const NAME: &str = "name";

/// Key of the identity application property
pub const IDENTITY: &str = "identity";

/// Key of the status code application property
pub const STATUS_CODE: &str = "statusCode";

/// Legacy key of the status code application property used by several
/// existing services
pub const LEGACY_STATUS_CODE: &str = "status-code";

/// Key of the status description application property
pub const STATUS_DESCRIPTION: &str = "statusDescription";

/// Legacy key of the status description application property used by
/// several existing services
pub const LEGACY_STATUS_DESCRIPTION: &str = "status-description";

/// Name of the READ operation
pub const READ: &str = "READ";

/// Name of the QUERY operation
pub const QUERY: &str = "QUERY";
