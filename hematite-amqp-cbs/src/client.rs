//! The CBS client

use fe2o3_amqp_types::primitives::Timestamp;
use hematite_amqp::session::SessionHandle;
use hematite_amqp_management::client::MgmtClient;

use crate::{
    constants::{CBS_NODE_ADDR, DEFAULT_CBS_CLIENT_NODE},
    error::{Error, Result},
    put_token::PutTokenRequest,
    token::{CbsToken, CbsTokenType},
    CbsTokenProvider,
};

/// CBS client: a management client against the `$cbs` node.
///
/// The connection should be opened with an ANONYMOUS SASL profile; the
/// actual authentication happens by putting a token. The client's lifetime
/// must stay within the session it was attached on: close the client
/// before ending the session.
#[derive(Debug)]
pub struct CbsClient {
    mgmt_client: MgmtClient,
}

impl CbsClient {
    /// Attaches a CBS client on the session
    pub async fn attach<R>(session: &mut SessionHandle<R>) -> Result<Self> {
        let mgmt_client = MgmtClient::builder()
            .management_node_address(CBS_NODE_ADDR)
            .client_node_addr(DEFAULT_CBS_CLIENT_NODE)
            .attach(session)
            .await?;

        Ok(Self { mgmt_client })
    }

    /// Detaches the CBS link pair
    pub async fn close(self) -> Result<()> {
        self.mgmt_client.close().await.map_err(Error::Mgmt)
    }

    /// Puts a token granting claims on the audience.
    ///
    /// Only the `Jwt` token type is supported by the put-token path for
    /// now; any other type fails with
    /// [`Error::UnsupportedTokenType`](crate::error::Error::UnsupportedTokenType)
    /// without any frame being sent. Any 2xx status reported by the peer
    /// counts as success; other statuses surface as a status error with
    /// the code and description the peer supplied.
    pub async fn put_token(
        &mut self,
        token_type: CbsTokenType,
        audience: impl Into<String>,
        token: impl Into<String>,
        expires_at: impl Into<Option<Timestamp>>,
    ) -> Result<()> {
        ensure_supported_token_type(token_type)?;

        let request = PutTokenRequest::new(
            audience.into(),
            token.into(),
            expires_at.into(),
            token_type.as_str(),
        );
        let _response = self.mgmt_client.call(request).await?;
        Ok(())
    }

    /// Fetches a token from the provider and puts it, returning the
    /// token's expiry so the caller can schedule a renewal.
    ///
    /// Renewal is never automatic: putting a fresh token before the expiry
    /// is the caller's responsibility.
    pub async fn authorize<P>(
        &mut self,
        provider: &mut P,
        resource: impl AsRef<str>,
        claims: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Result<Option<Timestamp>>
    where
        P: CbsTokenProvider,
        Error: From<P::Error>,
    {
        let CbsToken {
            token_value,
            token_type,
            expires_at_utc,
        } = provider.get_token(resource.as_ref(), claims)?;
        let token = token_value.into_owned();
        let expiry = expires_at_utc.clone();
        self.put_token(token_type, resource.as_ref(), token, expires_at_utc)
            .await?;
        Ok(expiry)
    }
}

fn ensure_supported_token_type(token_type: CbsTokenType) -> Result<()> {
    match token_type {
        CbsTokenType::Jwt => Ok(()),
        other => Err(Error::UnsupportedTokenType(other)),
    }
}

#[cfg(test)]
mod tests {
    use crate::{error::Error, token::CbsTokenType};

    use super::ensure_supported_token_type;

    #[test]
    fn sas_token_type_is_rejected_before_any_frame_is_sent() {
        let result = ensure_supported_token_type(CbsTokenType::Sas);
        assert!(matches!(
            result,
            Err(Error::UnsupportedTokenType(CbsTokenType::Sas))
        ));
    }

    #[test]
    fn jwt_token_type_is_supported() {
        assert!(ensure_supported_token_type(CbsTokenType::Jwt).is_ok());
    }
}
