//! Line-oriented authentication conversation.
//!
//! One conversation runs per ordered peer pair. The responder speaks
//! first with `AUTH <mechanism> [hex]`; the challenger answers every
//! line it receives. Payloads travel hex-encoded in a single token:
//!
//! ```text
//! AUTH <mechanism> [hex]     responder opens or switches mechanism
//! DATA [hex]                 mechanism payload, either direction
//! OK <guid-hex>              challenger accepts, sends its GUID
//! REJECTED [mech ...]        challenger refuses the mechanism
//! ERROR                      unrecoverable failure
//! ```

use crate::auth::mechanism::{AuthMechanism, AuthRole, AuthStep};
use crate::auth::registry::AuthRegistry;
use crate::error::{BusError, BusResult};
use std::sync::Arc;
use tether_crypto::guid::Guid;
use tether_crypto::keyblob::KeyBlob;
use tracing::{debug, warn};

/// Where a conversation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    /// No mechanism selected yet.
    Init,
    /// Challenger mid-mechanism, awaiting the next `DATA`.
    Challenging,
    /// Responder mid-mechanism, awaiting the challenger's line.
    Responding,
    /// Authenticated, master secret available.
    Success,
    /// Authentication failed, conversation is dead.
    Failure,
}

impl ConversationState {
    /// Success and Failure accept no further lines.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

/// A single authentication exchange with one peer, in one role.
///
/// The conversation owns the mechanism instance and the negotiated
/// master secret; callers feed it one peer line at a time through
/// [`advance`](Self::advance) and send back whatever it returns.
pub struct AuthConversation {
    role: AuthRole,
    state: ConversationState,
    registry: Arc<AuthRegistry>,
    acceptable: Vec<String>,
    tried: Vec<String>,
    mechanism: Option<Box<dyn AuthMechanism>>,
    mechanism_name: String,
    mechanism_complete: bool,
    retried: bool,
    local_guid: Guid,
    remote_guid: Option<Guid>,
    master: Option<KeyBlob>,
}

impl AuthConversation {
    /// Conversation that will open the exchange with `AUTH`.
    #[must_use]
    pub fn new_responder(
        registry: Arc<AuthRegistry>,
        acceptable: Vec<String>,
        local_guid: Guid,
    ) -> Self {
        Self::new(AuthRole::Responder, registry, acceptable, local_guid)
    }

    /// Conversation that answers a peer's `AUTH`.
    #[must_use]
    pub fn new_challenger(
        registry: Arc<AuthRegistry>,
        acceptable: Vec<String>,
        local_guid: Guid,
    ) -> Self {
        Self::new(AuthRole::Challenger, registry, acceptable, local_guid)
    }

    fn new(
        role: AuthRole,
        registry: Arc<AuthRegistry>,
        acceptable: Vec<String>,
        local_guid: Guid,
    ) -> Self {
        Self {
            role,
            state: ConversationState::Init,
            registry,
            acceptable,
            tried: Vec::new(),
            mechanism: None,
            mechanism_name: String::new(),
            mechanism_complete: false,
            retried: false,
            local_guid,
            remote_guid: None,
            master: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConversationState {
        self.state
    }

    /// Role this side plays.
    #[must_use]
    pub fn role(&self) -> AuthRole {
        self.role
    }

    /// Name of the selected mechanism, empty before selection.
    #[must_use]
    pub fn mechanism_name(&self) -> &str {
        &self.mechanism_name
    }

    /// The peer's GUID, known to the responder once `OK` arrives.
    #[must_use]
    pub fn remote_guid(&self) -> Option<Guid> {
        self.remote_guid
    }

    /// The negotiated master secret.
    ///
    /// # Errors
    ///
    /// [`BusError::KeyUnavailable`] unless the conversation succeeded.
    pub fn master_secret(&self) -> BusResult<KeyBlob> {
        if self.state != ConversationState::Success {
            return Err(BusError::key_unavailable("authentication not complete"));
        }
        self.master
            .clone()
            .ok_or(BusError::key_unavailable("authentication not complete"))
    }

    /// Produce the opening `AUTH` line. Responder only.
    ///
    /// # Errors
    ///
    /// [`BusError::NoAuthMechanism`] when the registry can build none of
    /// the acceptable mechanisms, [`BusError::AuthFailed`] when the
    /// selected mechanism refuses to start.
    pub fn start(&mut self) -> BusResult<String> {
        if self.role != AuthRole::Responder || self.state != ConversationState::Init {
            return Err(BusError::invalid_state("conversation cannot start"));
        }
        let candidates = self.registry.filter(&self.acceptable);
        let Some(name) = candidates.into_iter().next() else {
            return Err(BusError::NoAuthMechanism);
        };
        self.open_with(&name)
    }

    /// Select `name`, run its opening step, and build the `AUTH` line.
    fn open_with(&mut self, name: &str) -> BusResult<String> {
        let Some(mut mechanism) = self.registry.create(name) else {
            return Err(BusError::NoAuthMechanism);
        };
        debug!(mechanism = name, "opening authentication");
        let step = mechanism.initial_response()?;
        self.mechanism_name = name.to_string();
        self.tried.push(name.to_string());
        self.mechanism_complete = false;
        self.mechanism = Some(mechanism);
        self.state = ConversationState::Responding;
        match step {
            AuthStep::Continue(payload) => Ok(auth_line(name, &payload)),
            AuthStep::Complete(payload) => {
                self.mechanism_complete = true;
                Ok(auth_line(name, &payload))
            }
            AuthStep::Fail => {
                self.state = ConversationState::Failure;
                Err(BusError::auth_failed("mechanism failed to start"))
            }
        }
    }

    /// Consume one peer line and return the line to send back, if any.
    ///
    /// The challenger always answers while the conversation is live; a
    /// responder returning `None` means the exchange is over, for good
    /// or ill, and [`state`](Self::state) tells which.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidState`] when called on a finished
    /// conversation; key-generation failures bubble up from the
    /// mechanism.
    pub fn advance(&mut self, line: &str) -> BusResult<Option<String>> {
        if self.state.is_terminal() {
            return Err(BusError::invalid_state("conversation already complete"));
        }
        match self.role {
            AuthRole::Challenger => self.advance_challenger(line),
            AuthRole::Responder => self.advance_responder(line),
        }
    }

    fn advance_challenger(&mut self, line: &str) -> BusResult<Option<String>> {
        let mut words = line.split_whitespace();
        match (words.next(), self.state) {
            (Some("AUTH"), ConversationState::Init) => {
                let Some(name) = words.next() else {
                    return Ok(self.challenger_fail("AUTH without mechanism"));
                };
                let candidates = self.registry.filter(&self.acceptable);
                if !candidates.iter().any(|c| c == name) {
                    debug!(mechanism = name, "rejecting unacceptable mechanism");
                    return Ok(Some(rejected_line(&candidates)));
                }
                let Some(mechanism) = self.registry.create(name) else {
                    return Ok(Some(rejected_line(&candidates)));
                };
                let Some(payload) = decode_payload(words.next()) else {
                    return Ok(self.challenger_fail("malformed AUTH payload"));
                };
                self.mechanism_name = name.to_string();
                self.mechanism = Some(mechanism);
                self.run_challenge(&payload)
            }
            (Some("DATA"), ConversationState::Challenging) => {
                let Some(payload) = decode_payload(words.next()) else {
                    return Ok(self.challenger_fail("malformed DATA payload"));
                };
                self.run_challenge(&payload)
            }
            (Some("ERROR"), _) => {
                self.state = ConversationState::Failure;
                Ok(None)
            }
            _ => Ok(self.challenger_fail("unexpected line")),
        }
    }

    /// Feed the mechanism one response and translate its verdict.
    fn run_challenge(&mut self, payload: &[u8]) -> BusResult<Option<String>> {
        let Some(mechanism) = self.mechanism.as_mut() else {
            return Ok(self.challenger_fail("no mechanism selected"));
        };
        match mechanism.challenge(payload)? {
            AuthStep::Continue(data) => {
                self.state = ConversationState::Challenging;
                Ok(Some(data_line(&data)))
            }
            AuthStep::Complete(data) => {
                if !data.is_empty() {
                    debug!("discarding trailing challenge payload");
                }
                self.master = Some(mechanism.master_secret()?);
                self.state = ConversationState::Success;
                Ok(Some(format!("OK {}", self.local_guid)))
            }
            AuthStep::Fail => Ok(self.challenger_fail("mechanism rejected response")),
        }
    }

    fn challenger_fail(&mut self, reason: &str) -> Option<String> {
        warn!(mechanism = %self.mechanism_name, reason, "authentication failed");
        self.state = ConversationState::Failure;
        Some("ERROR".to_string())
    }

    fn advance_responder(&mut self, line: &str) -> BusResult<Option<String>> {
        if self.state != ConversationState::Responding {
            return Err(BusError::invalid_state("responder has not started"));
        }
        let mut words = line.split_whitespace();
        match words.next() {
            Some("DATA") => {
                if self.mechanism_complete {
                    return Ok(self.responder_fail("DATA after mechanism completed"));
                }
                let Some(payload) = decode_payload(words.next()) else {
                    return Ok(self.responder_fail("malformed DATA payload"));
                };
                let Some(mechanism) = self.mechanism.as_mut() else {
                    return Ok(self.responder_fail("no mechanism selected"));
                };
                match mechanism.response(&payload)? {
                    AuthStep::Continue(data) => Ok(Some(data_line(&data))),
                    AuthStep::Complete(data) => {
                        self.mechanism_complete = true;
                        if data.is_empty() {
                            Ok(None)
                        } else {
                            Ok(Some(data_line(&data)))
                        }
                    }
                    AuthStep::Fail => Ok(self.responder_fail("mechanism rejected challenge")),
                }
            }
            Some("OK") => {
                if !self.mechanism_complete {
                    return Ok(self.responder_fail("OK before mechanism completed"));
                }
                let Some(guid) = words.next().and_then(|g| g.parse::<Guid>().ok()) else {
                    return Ok(self.responder_fail("malformed OK guid"));
                };
                let Some(mechanism) = self.mechanism.as_ref() else {
                    return Ok(self.responder_fail("no mechanism selected"));
                };
                self.master = Some(mechanism.master_secret()?);
                self.remote_guid = Some(guid);
                self.state = ConversationState::Success;
                debug!(mechanism = %self.mechanism_name, peer_guid = %guid, "authentication succeeded");
                Ok(None)
            }
            Some("REJECTED") => {
                let offered: Vec<&str> = words.collect();
                let candidates = self.registry.filter(&self.acceptable);
                let next = candidates
                    .into_iter()
                    .find(|c| offered.iter().any(|o| o == c) && !self.tried.contains(c));
                match next {
                    Some(name) => {
                        debug!(mechanism = %name, "retrying with peer-offered mechanism");
                        self.open_with(&name).map(Some)
                    }
                    None => Ok(self.responder_fail("no mutually acceptable mechanism")),
                }
            }
            Some("ERROR") => {
                let interactive = self.mechanism.as_ref().is_some_and(|m| m.is_interactive());
                if interactive && !self.retried {
                    self.retried = true;
                    let name = self.mechanism_name.clone();
                    self.tried.retain(|t| t != &name);
                    debug!(mechanism = %name, "retrying interactive mechanism");
                    return self.open_with(&name).map(Some);
                }
                Ok(self.responder_fail("peer reported an error"))
            }
            _ => Ok(self.responder_fail("unexpected line")),
        }
    }

    fn responder_fail(&mut self, reason: &str) -> Option<String> {
        warn!(mechanism = %self.mechanism_name, reason, "authentication failed");
        self.state = ConversationState::Failure;
        None
    }
}

fn auth_line(name: &str, payload: &[u8]) -> String {
    if payload.is_empty() {
        format!("AUTH {name}")
    } else {
        format!("AUTH {name} {}", hex::encode(payload))
    }
}

fn data_line(payload: &[u8]) -> String {
    if payload.is_empty() {
        "DATA".to_string()
    } else {
        format!("DATA {}", hex::encode(payload))
    }
}

fn rejected_line(candidates: &[String]) -> String {
    if candidates.is_empty() {
        "REJECTED".to_string()
    } else {
        format!("REJECTED {}", candidates.join(" "))
    }
}

/// An absent payload token decodes to empty; a malformed one to `None`.
fn decode_payload(token: Option<&str>) -> Option<Vec<u8>> {
    match token {
        None => Some(Vec::new()),
        Some(hex_str) => hex::decode(hex_str).ok(),
    }
}
