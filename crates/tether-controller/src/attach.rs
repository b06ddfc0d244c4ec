//! Attach by process id.
//!
//! Installs the hook through an [`Injector`] and then establishes the
//! session in the requested direction:
//!
//! - listen: the target binds, the controller dials the reported address
//! - connect: the controller binds first, the target dials back in with
//!   the configured access token

use std::net::SocketAddr;

use tracing::info;

use tether_core::{Address, AttachConfig, AttachMode, ProcessId};
use tether_target::{InjectionPrimitive, Injector};
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::connect::{connect_with_retry, ControllerListener};
use crate::error::{ControllerError, Result};
use crate::session::ControllerSession;

fn address_of(addr: SocketAddr) -> Address {
    Address::new(addr.ip().to_string(), addr.port())
}

/// Attaches to `pid` and returns the bound session.
///
/// # Errors
///
/// - `Unset` if the config does not state `exit_on_disconnect`
/// - `Injection` if the bootstrap fails; it has already logged the pid,
///   phase and address
/// - `Negotiation` if the session cannot be established afterwards
pub async fn attach_by_pid<P: InjectionPrimitive>(
    injector: &Injector<P>,
    pid: ProcessId,
    mode: AttachMode,
    config: &ControllerConfig,
) -> Result<ControllerSession> {
    // Refuse before touching the target.
    config.session_options()?;
    info!(pid = %pid, mode = %mode, address = %config.address(), "Attaching");
    match mode {
        AttachMode::Listen => {
            let outcome = injector
                .install(pid, AttachConfig::listen(config.address()))
                .await?;
            let address = outcome.address().ok_or_else(|| ControllerError::UnexpectedResponse {
                command: "attach".to_string(),
            })?;
            connect_with_retry(&address_of(address), config, &CancellationToken::new()).await
        }
        AttachMode::Connect => {
            let listener = ControllerListener::bind(config.clone()).await?;
            let mut target_config = AttachConfig::connect(address_of(listener.local_addr()?));
            if let Some(token) = config.access_token.as_deref() {
                target_config = target_config.with_access_token(token);
            }
            let install = async {
                injector
                    .install(pid, target_config)
                    .await
                    .map_err(ControllerError::from)
            };
            let (session, _) = tokio::try_join!(listener.accept(), install)?;
            Ok(session)
        }
    }
}
