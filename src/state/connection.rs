//! Connection startup and authentication state machine.

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::backend::query::unexpected;
use crate::protocol::backend::{
    AuthenticationMessage, BackendKeyData, ErrorResponse, ParameterStatus,
    ReadyForQuery, is_async_message, msg_type,
};
use crate::protocol::frontend::auth::{ScramClient, md5_password};
use crate::protocol::frontend::{
    write_password, write_sasl_initial_response, write_sasl_response, write_startup,
};
use crate::protocol::types::TransactionStatus;

use super::StateMachine;
use super::action::{Action, parse_async_message};

const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Connection state during startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initial,
    WaitingAuth,
    SaslInProgress,
    WaitingAuthResult,
    WaitingReady,
    Ready,
}

/// Connection startup state machine.
///
/// Sends the StartupMessage, answers the authentication exchange
/// (cleartext, MD5 or SCRAM-SHA-256) and collects BackendKeyData and
/// ParameterStatus until the first ReadyForQuery.
pub struct ConnectionStateMachine {
    state: ConnectionState,
    options: Opts,
    backend_key: Option<(u32, u32)>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    scram_client: Option<ScramClient>,
}

impl ConnectionStateMachine {
    /// Create a new connection state machine.
    pub fn new(options: Opts) -> Self {
        Self {
            state: ConnectionState::Initial,
            options,
            backend_key: None,
            server_params: Vec::new(),
            transaction_status: TransactionStatus::Unknown,
            scram_client: None,
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Backend process id and secret key, used for cancel requests.
    pub fn backend_key(&self) -> Option<(u32, u32)> {
        self.backend_key
    }

    /// Take the server parameters reported during startup.
    pub fn take_server_params(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.server_params)
    }

    fn password(&self) -> Result<&str> {
        self.options
            .password
            .as_deref()
            .ok_or_else(|| Error::Auth("Password required but not provided".into()))
    }

    fn write_startup_message(&self, buffer_set: &mut BufferSet) {
        let mut params: Vec<(&str, &str)> = vec![
            ("user", &self.options.user),
            ("client_encoding", "UTF8"),
        ];

        if let Some(db) = &self.options.database {
            params.push(("database", db));
        }

        if let Some(app) = &self.options.application_name {
            params.push(("application_name", app));
        }

        for (name, value) in &self.options.params {
            params.push((name, value));
        }

        buffer_set.write_buffer.clear();
        write_startup(&mut buffer_set.write_buffer, &params);
    }

    fn handle_auth_message(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if buffer_set.type_byte != msg_type::AUTHENTICATION {
            return Err(unexpected("authentication", buffer_set.type_byte));
        }

        let auth = AuthenticationMessage::parse(&buffer_set.read_buffer)?;
        let mut out = Vec::new();

        match auth {
            AuthenticationMessage::Ok => {
                self.state = ConnectionState::WaitingReady;
                return Ok(Action::ReadMessage);
            }
            AuthenticationMessage::CleartextPassword => {
                write_password(&mut out, self.password()?);
                self.state = ConnectionState::WaitingAuthResult;
            }
            AuthenticationMessage::Md5Password { salt } => {
                let hashed = md5_password(&self.options.user, self.password()?, &salt);
                write_password(&mut out, &hashed);
                self.state = ConnectionState::WaitingAuthResult;
            }
            AuthenticationMessage::Sasl { mechanisms } => {
                if !mechanisms.contains(&SCRAM_SHA_256) {
                    return Err(Error::Auth(format!(
                        "No supported SASL mechanism. Server offers: {:?}",
                        mechanisms
                    )));
                }

                let scram = ScramClient::new(self.password()?);
                let client_first = scram.client_first_message();
                write_sasl_initial_response(&mut out, SCRAM_SHA_256, client_first.as_bytes());
                self.scram_client = Some(scram);
                self.state = ConnectionState::SaslInProgress;
            }
            other => {
                return Err(Error::Unsupported(format!(
                    "Unsupported authentication method: {:?}",
                    other
                )));
            }
        }

        buffer_set.write_buffer.clear();
        buffer_set.write_buffer.extend_from_slice(&out);
        Ok(Action::WriteAndReadMessage)
    }

    fn handle_sasl_message(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if buffer_set.type_byte != msg_type::AUTHENTICATION {
            return Err(unexpected("SASL exchange", buffer_set.type_byte));
        }

        let scram = self
            .scram_client
            .as_mut()
            .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;

        match AuthenticationMessage::parse(&buffer_set.read_buffer)? {
            AuthenticationMessage::SaslContinue { data } => {
                let server_first = simdutf8::basic::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("Invalid server-first-message: {}", e)))?;
                let client_final = scram.process_server_first(server_first)?;

                buffer_set.write_buffer.clear();
                write_sasl_response(&mut buffer_set.write_buffer, client_final.as_bytes());
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::SaslFinal { data } => {
                let server_final = simdutf8::basic::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("Invalid server-final-message: {}", e)))?;
                scram.verify_server_final(server_final)?;

                self.state = ConnectionState::WaitingAuthResult;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Protocol(format!(
                "Unexpected SASL message: {:?}",
                other
            ))),
        }
    }

    fn handle_auth_result(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if buffer_set.type_byte != msg_type::AUTHENTICATION {
            return Err(unexpected("authentication result", buffer_set.type_byte));
        }

        match AuthenticationMessage::parse(&buffer_set.read_buffer)? {
            AuthenticationMessage::Ok => {
                self.state = ConnectionState::WaitingReady;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Auth(format!("Unexpected auth result: {:?}", other))),
        }
    }

    fn handle_ready_message(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let payload = buffer_set.read_buffer.as_slice();

        match buffer_set.type_byte {
            msg_type::BACKEND_KEY_DATA => {
                let key = BackendKeyData::parse(payload)?;
                self.backend_key = Some((key.process_id(), key.secret()));
                Ok(Action::ReadMessage)
            }
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(payload)?;
                self.server_params
                    .push((param.name.to_string(), param.value.to_string()));
                Ok(Action::ReadMessage)
            }
            msg_type::NEGOTIATE_PROTOCOL_VERSION => Ok(Action::ReadMessage),
            msg_type::READY_FOR_QUERY => {
                self.transaction_status = ReadyForQuery::parse(payload)?.transaction_status()?;
                self.state = ConnectionState::Ready;
                Ok(Action::Finished)
            }
            other => Err(unexpected("startup", other)),
        }
    }
}

impl StateMachine for ConnectionStateMachine {
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if self.state == ConnectionState::Initial {
            self.write_startup_message(buffer_set);
            self.state = ConnectionState::WaitingAuth;
            return Ok(Action::WriteAndReadMessage);
        }

        let type_byte = buffer_set.type_byte;

        // ParameterStatus is only asynchronous once startup is over
        if is_async_message(type_byte) && type_byte != msg_type::PARAMETER_STATUS {
            return Ok(Action::HandleAsyncMessageAndReadMessage(
                parse_async_message(buffer_set)?,
            ));
        }

        if type_byte == msg_type::ERROR_RESPONSE {
            return Err(ErrorResponse::parse(&buffer_set.read_buffer)?.into_error());
        }

        match self.state {
            ConnectionState::WaitingAuth => self.handle_auth_message(buffer_set),
            ConnectionState::SaslInProgress => self.handle_sasl_message(buffer_set),
            ConnectionState::WaitingAuthResult => self.handle_auth_result(buffer_set),
            ConnectionState::WaitingReady => self.handle_ready_message(buffer_set),
            state => Err(Error::Protocol(format!(
                "Unexpected message in state {:?}",
                state
            ))),
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }
}
