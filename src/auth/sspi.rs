//! Windows challenge-response provider backed by the SSPI NTLM package.

use sspi::{
    AuthIdentity, ClientRequestFlags, CredentialUse, DataRepresentation, Ntlm, SecurityBuffer,
    SecurityBufferType, Sspi, SspiImpl, Username,
};

use crate::auth::ntlm::ChallengeResponseProvider;
use crate::error::TssError;

/// Per-request NTLM security context. Discarded after the request completes
/// or fails; never reused across handshakes.
pub(crate) struct SspiProvider {
    ntlm: Ntlm,
    credentials: <Ntlm as SspiImpl>::CredentialsHandle,
}

impl SspiProvider {
    pub(crate) fn new(domain: &str, username: &str, password: &str) -> Result<Self, TssError> {
        let mut ntlm = Ntlm::new();

        let qualified = if domain.is_empty() {
            username.to_owned()
        } else {
            format!("{domain}\\{username}")
        };
        let identity = AuthIdentity {
            username: Username::parse(&qualified)
                .map_err(|err| TssError::Auth(format!("invalid NTLM identity: {err}")))?,
            password: password.to_owned().into(),
        };

        let acquired = ntlm
            .acquire_credentials_handle()
            .with_credential_use(CredentialUse::Outbound)
            .with_auth_data(&identity)
            .execute(&mut ntlm)
            .map_err(|err| TssError::Auth(format!("acquiring NTLM credentials failed: {err}")))?;

        Ok(Self {
            ntlm,
            credentials: acquired.credentials_handle,
        })
    }

    fn step(&mut self, input: Option<&[u8]>) -> Result<Vec<u8>, TssError> {
        let mut output = vec![SecurityBuffer::new(Vec::new(), SecurityBufferType::Token)];
        let mut input_buffers = input
            .map(|challenge| vec![SecurityBuffer::new(challenge.to_vec(), SecurityBufferType::Token)]);

        let mut builder = self
            .ntlm
            .initialize_security_context()
            .with_credentials_handle(&mut self.credentials)
            .with_context_requirements(ClientRequestFlags::CONNECTION)
            .with_target_data_representation(DataRepresentation::Native)
            .with_target_name("")
            .with_output(&mut output);
        if let Some(buffers) = input_buffers.as_mut() {
            builder = builder.with_input(buffers);
        }

        self.ntlm
            .initialize_security_context_impl(&mut builder)
            .and_then(sspi::generator::GeneratorInitSecurityContext::resolve_to_result)
            .map_err(|err| TssError::Auth(format!("NTLM security context failed: {err}")))?;

        Ok(output.remove(0).buffer)
    }
}

impl ChallengeResponseProvider for SspiProvider {
    fn negotiate(&mut self) -> Result<Vec<u8>, TssError> {
        self.step(None)
    }

    fn challenge_response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, TssError> {
        self.step(Some(challenge))
    }
}
