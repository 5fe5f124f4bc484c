//! Constants of the CBS draft protocol

/// Address of the CBS node defined in the draft
pub const CBS_NODE_ADDR: &str = "$cbs";

/// Default address of the CBS client node
pub const DEFAULT_CBS_CLIENT_NODE: &str = "cbs-client-node";

/// The put-token operation
pub const PUT_TOKEN: &str = "put-token";

/// Key of the expiration application property
pub const EXPIRATION: &str = "expiration";

/// Token type of a JSON web token
pub const CBS_TOKEN_TYPE_JWT: &str = "jwt";

/// Token type of a service bus SAS token
pub const CBS_TOKEN_TYPE_SAS: &str = "servicebus.windows.net:sastoken";
