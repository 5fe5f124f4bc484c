use fe2o3_amqp_types::sasl::SaslCode;

/// SASL negotiation error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested mechanism or incoming frame is not supported
    #[error("Not implemented: {0:?}")]
    NotImplemented(Option<String>),

    /// The peer rejected the negotiation
    #[error("SASL outcome code: {:?}", .code)]
    NotOk {
        /// Outcome code reported by the peer
        code: SaslCode,

        /// Additional data supplied by the peer
        additional_data: Option<Vec<u8>>,
    },
}
