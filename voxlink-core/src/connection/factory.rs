//! Builds service connections from `ServiceConfig` plus a fetched credential.

use std::sync::Arc;

use tracing::debug;
use url::Url;

use super::transport::{HandshakeRequest, Transport, WsTransport};
use super::Connection;
use crate::auth::AuthInfo;
use crate::config::ServiceConfig;
use crate::error::{Result, VoxlinkError};
use crate::events::EventSink;
use crate::message::{Headers, MessageFormatter, SpeechMessageFormatter};

const LANGUAGE_PARAM: &str = "language";
const FORMAT_PARAM: &str = "format";

pub struct ConnectionFactory {
    config: ServiceConfig,
    transport: Arc<dyn Transport>,
    formatter: Arc<dyn MessageFormatter>,
    events: EventSink,
}

impl ConnectionFactory {
    /// Factory using the WebSocket transport and the speech formatter.
    ///
    /// # Errors
    /// `VoxlinkError::Config` if `config` fails validation.
    pub fn new(config: ServiceConfig, events: EventSink) -> Result<Self> {
        Self::with_transport(config, Arc::new(WsTransport::new()), events)
    }

    pub fn with_transport(
        mut config: ServiceConfig,
        transport: Arc<dyn Transport>,
        events: EventSink,
    ) -> Result<Self> {
        config.normalize();
        config.validate()?;
        Ok(Self {
            config,
            transport,
            formatter: Arc::new(SpeechMessageFormatter::new()),
            events,
        })
    }

    /// Replace the formatter used by connections created from now on.
    pub fn with_formatter(mut self, formatter: Arc<dyn MessageFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Service URL for the configured region, mode, language and format.
    ///
    /// An explicit `endpoint` is used as-is apart from filling in any missing
    /// `language`/`format` query parameters.
    pub fn build_uri(&self) -> Result<Url> {
        let mut uri = match &self.config.endpoint {
            Some(endpoint) => Url::parse(endpoint)
                .map_err(|e| VoxlinkError::Config(format!("endpoint '{endpoint}': {e}")))?,
            None => {
                let raw = format!(
                    "wss://{}.{}/speech/recognition/{}/cognitiveservices/v1",
                    self.config.region,
                    self.config.host_suffix,
                    self.config.recognition_mode.path_segment(),
                );
                Url::parse(&raw).map_err(|e| VoxlinkError::Config(format!("'{raw}': {e}")))?
            }
        };

        let present: Vec<String> = uri.query_pairs().map(|(k, _)| k.into_owned()).collect();
        {
            let mut query = uri.query_pairs_mut();
            if !present.iter().any(|k| k == LANGUAGE_PARAM) {
                query.append_pair(LANGUAGE_PARAM, &self.config.language);
            }
            if !present.iter().any(|k| k == FORMAT_PARAM) {
                query.append_pair(FORMAT_PARAM, self.config.output_format.as_str());
            }
        }
        Ok(uri)
    }

    /// A new, unopened connection carrying `auth` on its handshake.
    pub fn create(&self, auth: &AuthInfo, connection_id: &str) -> Result<Connection> {
        let uri = self.build_uri()?;
        debug!(connection_id, uri = %uri, "creating connection");
        let headers = Headers::new().with(auth.header_name(), auth.token());
        Ok(Connection::new(
            connection_id,
            HandshakeRequest { uri, headers },
            Arc::clone(&self.transport),
            Arc::clone(&self.formatter),
            self.events.clone(),
        ))
    }
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("region", &self.config.region)
            .field("mode", &self.config.recognition_mode)
            .finish_non_exhaustive()
    }
}
