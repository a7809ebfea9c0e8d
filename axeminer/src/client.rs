// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Stratum V1 pool client. Owns the socket, performs the
//! configure/subscribe/authorize handshake, dispatches inbound messages,
//! submits shares and handles reconnects and primary/fallback failover.

use axe_logging::macros::*;

use axe_stratum_v1::framing::Codec;
use axe_stratum_v1::messages::{
    parse_result, Authorize, ClientReconnect, Configure, ConfigureResult, Notify, SetDifficulty,
    SetVersionMask, Submit, Subscribe, SubscribeResult, SuggestDifficulty,
};
use axe_stratum_v1::rpc::{Method, Request, RequestPayload, Response, Rpc};
use axe_stratum_v1::{HexBytes, HexU32Be};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::bm13xx::Model;
use crate::config;
use crate::error::{Error, Result};
use crate::hub::CoreHandle;
use crate::job;
use crate::stats;

use std::collections::HashMap;
use std::convert::{TryFrom, TryInto};
use std::sync::Arc;
use std::time::Duration;

/// Version rolling mask requested from the pool; the pool answers with the
/// subset it actually grants
const REQUESTED_VERSION_MASK: u32 = 0xffff_ffff;
/// Minimum rollable bits we ask for per BIP310
const MIN_VERSION_BITS: usize = 16;
/// Consecutive fallback failures before the primary is retried
const FALLBACK_GIVE_BACK: u32 = 5;
/// Reconnect backoff bounds
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// `user-agent` announced in the subscription
pub fn user_agent(model: Model) -> String {
    format!("bitaxe/{}/{}", model.name(), env!("CARGO_PKG_VERSION"))
}

/// One upstream server with worker credentials
#[derive(Debug, Clone)]
pub struct PoolEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// Primary and optional fallback endpoints from the settings
pub fn endpoints_from_settings(settings: &config::Settings) -> Vec<PoolEndpoint> {
    let mut endpoints = vec![PoolEndpoint {
        host: settings.stratum_url.clone(),
        port: settings.stratum_port,
        user: settings.stratum_user.clone(),
        password: settings.stratum_pass.clone(),
    }];
    if settings.has_fallback_pool() {
        endpoints.push(PoolEndpoint {
            host: settings.fallback_stratum_url.clone(),
            port: settings.fallback_stratum_port,
            user: settings.fallback_stratum_user.clone(),
            password: settings.fallback_stratum_pass.clone(),
        });
    }
    endpoints
}

/// Why a session ended
enum SessionExit {
    /// Connection is gone; dial again per the failover policy
    Closed,
    /// The pool redirected us
    Reconnect(ClientReconnect),
    /// The local pipeline shut down; leave the client loop
    Shutdown,
}

/// Requests in flight, keyed by message id
enum Pending {
    Configure,
    Subscribe,
    Authorize,
    SuggestDifficulty,
    Submit {
        /// Pool difficulty the share was mined against, for accounting
        pool_difficulty: f64,
    },
}

pub struct Client {
    core: CoreHandle,
    endpoints: Vec<PoolEndpoint>,
    user_agent: String,
    /// Difficulty hint after authorization; 0 disables it
    suggest_difficulty: u64,
    notify_tx: mpsc::Sender<job::Notification>,
    submit_rx: mpsc::Receiver<job::Share>,
    meter: Arc<stats::Meter>,
}

impl Client {
    pub fn new(
        core: CoreHandle,
        endpoints: Vec<PoolEndpoint>,
        user_agent: String,
        suggest_difficulty: u64,
        notify_tx: mpsc::Sender<job::Notification>,
        submit_rx: mpsc::Receiver<job::Share>,
        meter: Arc<stats::Meter>,
    ) -> Self {
        assert!(!endpoints.is_empty(), "BUG: no pool endpoints configured");
        Self {
            core,
            endpoints,
            user_agent,
            suggest_difficulty,
            notify_tx,
            submit_rx,
            meter,
        }
    }

    /// Pool connection loop: dial, run the session, fail over, back off.
    /// Returns `Ok` when the local pipeline shuts down and `Err` only for
    /// conditions mining cannot continue from (refused credentials).
    pub async fn run(mut self) -> Result<()> {
        let mut active = 0usize;
        let mut fallback_failures = 0u32;
        let mut backoff = BACKOFF_START;
        let mut redirect: Option<(String, u16)> = None;

        loop {
            let endpoint = self.endpoints[active].clone();
            let (host, port) =
                redirect.take().unwrap_or_else(|| (endpoint.host.clone(), endpoint.port));
            info!(
                "Connecting to stratum pool {}:{} (user {})",
                host, port, endpoint.user
            );

            let outcome = match TcpStream::connect((host.as_str(), port)).await {
                Ok(stream) => {
                    let mut framed = Framed::new(stream, Codec::new());
                    self.drive_session(&mut framed, &endpoint).await
                }
                Err(e) => Err(e.into()),
            };

            // whatever ended the session, in-flight work no longer has an
            // upstream to report to
            self.core.bump_epoch();
            self.core.clear_jobs();

            match outcome {
                Ok(SessionExit::Shutdown) => return Ok(()),
                Ok(SessionExit::Reconnect(reconnect)) => {
                    info!(
                        "pool requested reconnect (host {:?}, port {:?})",
                        reconnect.host, reconnect.port
                    );
                    if let Some(wait) = reconnect.wait_time {
                        tokio::time::sleep(Duration::from_secs(wait)).await;
                    }
                    if let (Some(new_host), Some(new_port)) = (reconnect.host, reconnect.port) {
                        redirect = Some((new_host, new_port));
                    }
                    backoff = BACKOFF_START;
                    continue;
                }
                Ok(SessionExit::Closed) => {
                    // the session was up; retry the same pool promptly
                    warn!("pool connection closed");
                    backoff = BACKOFF_START;
                }
                Err(Error::AuthFailed(reason)) => {
                    error!("pool refused worker credentials: {}", reason);
                    return Err(Error::AuthFailed(reason));
                }
                Err(e) => {
                    warn!("pool session failed: {}", e);
                    // failover is sticky on the fallback until it keeps
                    // failing on its own
                    if self.endpoints.len() > 1 {
                        if active == 0 {
                            info!("failing over to the fallback pool");
                            active = 1;
                            fallback_failures = 0;
                        } else {
                            fallback_failures += 1;
                            if fallback_failures >= FALLBACK_GIVE_BACK {
                                info!("fallback pool keeps failing, retrying the primary");
                                active = 0;
                                fallback_failures = 0;
                            }
                        }
                    }
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    async fn drive_session<T>(
        &mut self,
        framed: &mut Framed<T, Codec>,
        endpoint: &PoolEndpoint,
    ) -> Result<SessionExit>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let core = self.core.clone();
        let notify_tx = self.notify_tx.clone();
        let meter = self.meter.clone();
        let submit_rx = &mut self.submit_rx;

        // shares queued for a previous session have no upstream anymore
        while submit_rx.try_recv().is_ok() {}

        let mut session = Session::new(
            endpoint.clone(),
            self.user_agent.clone(),
            self.suggest_difficulty,
        );
        session.start(framed).await?;

        loop {
            tokio::select! {
                line = framed.next() => match line {
                    None => {
                        return Ok(SessionExit::Closed);
                    }
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Rpc::Request(request))) => {
                        if let Some(exit) =
                            session.handle_request(&core, &notify_tx, request).await?
                        {
                            return Ok(exit);
                        }
                    }
                    Some(Ok(Rpc::Response(response))) => {
                        session.handle_response(framed, &core, &meter, response).await?;
                    }
                },
                share = submit_rx.recv() => match share {
                    Some(share) => session.submit(framed, share).await?,
                    None => {
                        info!("share pipeline closed, shutting the client down");
                        return Ok(SessionExit::Shutdown);
                    }
                },
            }
        }
    }
}

/// State of one pool connection. The message id counter lives here and
/// starts over with every new session.
struct Session {
    endpoint: PoolEndpoint,
    user_agent: String,
    suggest_difficulty: u64,
    next_id: u32,
    pending: HashMap<u32, Pending>,
    authorized: bool,
}

impl Session {
    fn new(endpoint: PoolEndpoint, user_agent: String, suggest_difficulty: u64) -> Self {
        Self {
            endpoint,
            user_agent,
            suggest_difficulty,
            next_id: 0,
            pending: HashMap::new(),
            authorized: false,
        }
    }

    /// Ids are monotonically increasing positive integers
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    async fn send_request<T, M>(
        &mut self,
        framed: &mut Framed<T, Codec>,
        message: M,
        pending: Pending,
    ) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
        M: TryInto<RequestPayload, Error = axe_stratum_v1::Error>,
    {
        let payload = message.try_into()?;
        let id = self.next_id();
        self.pending.insert(id, pending);
        framed
            .send(Rpc::Request(Request {
                id: Some(id),
                payload,
            }))
            .await?;
        Ok(())
    }

    /// Kick off the handshake; the subsequent steps are driven by the
    /// responses as they come in
    async fn start<T>(&mut self, framed: &mut Framed<T, Codec>) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let configure = Configure::version_rolling(REQUESTED_VERSION_MASK, MIN_VERSION_BITS)?;
        self.send_request(framed, configure, Pending::Configure).await
    }

    async fn handle_request(
        &mut self,
        core: &CoreHandle,
        notify_tx: &mpsc::Sender<job::Notification>,
        request: Request,
    ) -> Result<Option<SessionExit>> {
        match request.payload.method {
            Method::Notify => {
                let notify = Notify::try_from(request)?;
                let epoch = if notify.clean_jobs {
                    let epoch = core.bump_epoch();
                    info!(
                        "clean jobs: abandoning outstanding work (epoch {})",
                        epoch
                    );
                    epoch
                } else {
                    core.current_epoch()
                };
                // a malformed notification means the session is beyond repair
                let notification = job::Notification::from_notify(&notify, epoch)?;
                debug!(
                    "new job {} (clean={})",
                    notification.job_id, notification.clean_jobs
                );
                if notify_tx.send(notification).await.is_err() {
                    return Ok(Some(SessionExit::Shutdown));
                }
            }
            Method::SetDifficulty => {
                let difficulty = SetDifficulty::try_from(request)?.difficulty;
                info!("pool difficulty set to {}", difficulty);
                core.set_pool_difficulty(difficulty);
            }
            Method::SetVersionMask => {
                let mask = SetVersionMask::try_from(request)?.mask.0;
                info!("pool adjusted version mask to {:#010x}", mask);
                core.set_version_mask(mask);
            }
            Method::ClientReconnect => {
                let reconnect = ClientReconnect::try_from(request)?;
                return Ok(Some(SessionExit::Reconnect(reconnect)));
            }
            method => {
                warn!("ignoring unsupported request {:?}", method);
            }
        }
        Ok(None)
    }

    async fn handle_response<T>(
        &mut self,
        framed: &mut Framed<T, Codec>,
        core: &CoreHandle,
        meter: &stats::Meter,
        response: Response,
    ) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let pending = match self.pending.remove(&response.id) {
            Some(pending) => pending,
            None => {
                warn!("response to unknown id {}", response.id);
                return Ok(());
            }
        };
        let error_reason = response.error.as_ref().map(|e| e.1.clone());

        match pending {
            Pending::Configure => {
                // pools without the extension answer with an error or an
                // empty result; mining continues without version rolling
                let mask = parse_result::<ConfigureResult>(response)
                    .ok()
                    .and_then(|result| result.version_rolling_mask());
                match mask {
                    Some(mask) => {
                        info!("negotiated version rolling mask {:#010x}", mask);
                        core.set_version_mask(mask);
                    }
                    None => {
                        warn!("pool does not support version rolling");
                        core.set_version_mask(0);
                    }
                }
                let subscribe = Subscribe {
                    agent: self.user_agent.clone(),
                };
                self.send_request(framed, subscribe, Pending::Subscribe).await?;
            }
            Pending::Subscribe => {
                if let Some(reason) = error_reason {
                    return Err(Error::Protocol(format!("subscribe refused: {}", reason)));
                }
                let result: SubscribeResult = parse_result(response)?;
                info!(
                    "subscribed: extranonce_1 {}, extranonce_2_size {}",
                    hex::encode(result.extranonce_1.as_ref()),
                    result.extranonce_2_size
                );
                core.set_extranonce(
                    result.extranonce_1.as_ref().to_vec(),
                    result.extranonce_2_size,
                );
                let authorize = Authorize {
                    user: self.endpoint.user.clone(),
                    password: self.endpoint.password.clone(),
                };
                self.send_request(framed, authorize, Pending::Authorize).await?;
            }
            Pending::Authorize => {
                if !matches!(parse_result::<bool>(response), Ok(true)) {
                    return Err(Error::AuthFailed(
                        error_reason.unwrap_or_else(|| "worker not authorized".to_string()),
                    ));
                }
                self.authorized = true;
                info!("authorized as {}", self.endpoint.user);
                if self.suggest_difficulty > 0 {
                    let suggest = SuggestDifficulty {
                        difficulty: self.suggest_difficulty as f64,
                    };
                    self.send_request(framed, suggest, Pending::SuggestDifficulty)
                        .await?;
                }
            }
            Pending::SuggestDifficulty => {
                // advisory only; pools are free to ignore it
            }
            Pending::Submit { pool_difficulty } => match parse_result::<bool>(response) {
                Ok(true) => {
                    core.account_accepted();
                    meter.account_shares(pool_difficulty as u64);
                    trace!("share accepted");
                }
                _ => {
                    let reason = error_reason.unwrap_or_else(|| "unknown reason".to_string());
                    warn!("share rejected: {}", reason);
                    core.account_rejected(Some(reason));
                }
            },
        }
        Ok(())
    }

    async fn submit<T>(&mut self, framed: &mut Framed<T, Codec>, share: job::Share) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.authorized {
            warn!("dropping share, session not authorized yet");
            return Ok(());
        }
        info!(
            "submitting share: job={} nonce={:08x} version={:08x} diff={:.3}",
            share.job_id, share.nonce, share.version, share.share_difficulty
        );
        let message = Submit {
            user: self.endpoint.user.clone(),
            job_id: share.job_id,
            extranonce_2: HexBytes(share.extranonce_2),
            ntime: HexU32Be(share.ntime),
            nonce: HexU32Be(share.nonce),
            version: HexU32Be(share.version),
        };
        self.send_request(
            framed,
            message,
            Pending::Submit {
                pool_difficulty: share.pool_difficulty,
            },
        )
        .await
    }
}
