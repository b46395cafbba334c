use std::time::Duration;

use bitcoin::{OutPoint, Script, ScriptBuf, Txid};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use crate::error::{CoreError, ProtocolError};
use crate::source::parsing::parse_verbose_transaction;
use crate::types::ResolvedTransaction;

use super::protocol::{
    decode_line, encode_request, HistoryEntry, Incoming, METHOD_GET_HISTORY, METHOD_PING,
    METHOD_SUBSCRIBE, METHOD_TX_GET, METHOD_UNSUBSCRIBE,
};
use super::scripthash::{script_hash, ScriptHash};
use super::tls::insecure_connector;
use super::ElectrumConfig;

/// Longest response line accepted. Verbose transactions near the block
/// weight limit stay well below this.
const MAX_LINE_BYTES: u64 = 32 * 1024 * 1024;

/// One open connection to an Electrum server.
///
/// Requests are strictly sequential: each call writes one line and reads
/// until the matching response. Ids start at 1 and increase by one per
/// request on this connection.
pub struct ElectrumSession<S> {
    stream: BufReader<S>,
    origin: String,
    next_id: u64,
    io_timeout: Duration,
    max_line_bytes: u64,
}

impl<S> ElectrumSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, origin: impl Into<String>, io_timeout: Duration) -> Self {
        Self {
            stream: BufReader::new(stream),
            origin: origin.into(),
            next_id: 1,
            io_timeout,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: u64) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    fn error(&self, method: &str, detail: impl Into<String>) -> ProtocolError {
        ProtocolError::new(self.origin.clone(), method, detail)
    }

    /// Send one request and wait for its response, skipping notifications.
    pub async fn request(
        &mut self,
        method: &str,
        params: &[serde_json::Value],
    ) -> Result<serde_json::Value, ProtocolError> {
        let id = self.next_id;
        self.next_id += 1;

        let line = encode_request(id, method, params)
            .map_err(|e| self.error(method, format!("encode request: {e}")))?;
        debug!(electrum.id = id, electrum.method = method, origin = %self.origin, "electrum request");

        let io_timeout = self.io_timeout;
        let write = async {
            self.stream.write_all(&line).await?;
            self.stream.flush().await
        };
        match timeout(io_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.error(method, format!("write failed: {e}"))),
            Err(_) => return Err(self.error(method, format!("write timed out after {io_timeout:?}"))),
        }

        loop {
            let mut buf = Vec::new();
            let max_line_bytes = self.max_line_bytes;
            let read = {
                let mut limited = (&mut self.stream).take(max_line_bytes);
                timeout(io_timeout, limited.read_until(b'\n', &mut buf)).await
            };
            match read {
                Ok(Ok(0)) => return Err(self.error(method, "connection closed by server")),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(self.error(method, format!("read failed: {e}"))),
                Err(_) => {
                    return Err(self.error(method, format!("read timed out after {io_timeout:?}")))
                }
            }
            if buf.last() != Some(&b'\n') {
                if buf.len() as u64 >= max_line_bytes {
                    return Err(self.error(
                        method,
                        format!("response line exceeds {max_line_bytes} bytes"),
                    ));
                }
                return Err(self.error(method, "connection closed mid-response"));
            }
            if buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            trace!(electrum.id = id, line = %String::from_utf8_lossy(&buf).trim_end(), "electrum line");

            match decode_line(&buf).map_err(|detail| self.error(method, detail))? {
                Incoming::Notification { method: note } => {
                    debug!(electrum.method = %note, "skipping electrum notification");
                }
                Incoming::Response { id: got, .. } if got != id => {
                    return Err(self.error(
                        method,
                        format!("response id {got} does not match request id {id}"),
                    ));
                }
                Incoming::Response { outcome, .. } => {
                    return outcome.map_err(|err| self.error(method, format!("server error: {err}")));
                }
            }
        }
    }

    pub async fn ping(&mut self) -> Result<(), ProtocolError> {
        self.request(METHOD_PING, &[]).await.map(|_| ())
    }

    /// Current status hash of the scripthash, `None` when it has no history.
    pub async fn subscribe_script_hash(
        &mut self,
        sh: &ScriptHash,
    ) -> Result<Option<String>, ProtocolError> {
        let result = self
            .request(METHOD_SUBSCRIBE, &[serde_json::json!(sh.to_string())])
            .await?;
        Ok(result.as_str().map(str::to_owned))
    }

    pub async fn get_history(&mut self, sh: &ScriptHash) -> Result<Vec<HistoryEntry>, ProtocolError> {
        let result = self
            .request(METHOD_GET_HISTORY, &[serde_json::json!(sh.to_string())])
            .await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(result)
            .map_err(|e| self.error(METHOD_GET_HISTORY, format!("malformed history: {e}")))
    }

    /// Best effort; failures are logged and swallowed.
    pub async fn unsubscribe_script_hash(&mut self, sh: &ScriptHash) {
        if let Err(e) = self
            .request(METHOD_UNSUBSCRIBE, &[serde_json::json!(sh.to_string())])
            .await
        {
            warn!(scripthash = %sh, error = %e, "electrum unsubscribe failed");
        }
    }

    /// Verbose transaction, `None` when the server returns `null`.
    pub async fn get_transaction_verbose(
        &mut self,
        txid: &Txid,
    ) -> Result<Option<ResolvedTransaction>, ProtocolError> {
        let raw = self.get_transaction_raw(txid).await?;
        if raw.is_null() {
            return Ok(None);
        }
        parse_verbose_transaction(&raw)
            .map(Some)
            .map_err(|e| self.error(METHOD_TX_GET, format!("malformed transaction: {e}")))
    }

    async fn get_transaction_raw(&mut self, txid: &Txid) -> Result<serde_json::Value, ProtocolError> {
        self.request(
            METHOD_TX_GET,
            &[serde_json::json!(txid.to_string()), serde_json::json!(true)],
        )
        .await
    }

    /// Locking script of `outpoint`, read from its creating transaction.
    pub async fn output_script(
        &mut self,
        outpoint: &OutPoint,
    ) -> Result<Option<ScriptBuf>, ProtocolError> {
        let Some(tx) = self.get_transaction_verbose(&outpoint.txid).await? else {
            return Ok(None);
        };
        Ok(tx
            .output(outpoint.vout)
            .and_then(|o| o.script_pub_key.clone()))
    }

    /// Txid spending `outpoint`, whose locking script is `script_pub_key`.
    ///
    /// The subscription is always released, whether or not the history
    /// lookup succeeded. Empty history means unspent (`Ok(None)`); a failed
    /// lookup is an error. A history entry whose transaction body does not
    /// parse is skipped; connection and server errors still end the lookup.
    pub async fn find_spending_transaction(
        &mut self,
        outpoint: &OutPoint,
        script_pub_key: &Script,
    ) -> Result<Option<Txid>, ProtocolError> {
        let sh = script_hash(script_pub_key);

        let history = match self.subscribe_script_hash(&sh).await {
            Ok(_) => self.get_history(&sh).await,
            Err(e) => Err(e),
        };
        self.unsubscribe_script_hash(&sh).await;
        let history = history?;
        debug!(%outpoint, scripthash = %sh, entries = history.len(), "electrum history");

        for entry in history.iter().filter(|e| e.tx_hash != outpoint.txid) {
            let raw = self.get_transaction_raw(&entry.tx_hash).await?;
            if raw.is_null() {
                continue;
            }
            let candidate = match parse_verbose_transaction(&raw) {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!(%outpoint, candidate = %entry.tx_hash, error = %e, "skipping malformed history transaction");
                    continue;
                }
            };
            if candidate
                .inputs
                .iter()
                .any(|input| input.prevout.as_ref() == Some(outpoint))
            {
                return Ok(Some(entry.tx_hash));
            }
        }
        Ok(None)
    }
}

// ==============================================================================
// Client
// ==============================================================================

/// Factory for TLS sessions to one configured Electrum server.
pub struct ElectrumClient {
    config: ElectrumConfig,
    connector: TlsConnector,
}

impl ElectrumClient {
    pub fn new(config: ElectrumConfig) -> Result<Self, CoreError> {
        if config.host.is_empty() {
            return Err(CoreError::Config("electrum host must not be empty".into()));
        }
        Ok(Self {
            connector: insecure_connector()?,
            config,
        })
    }

    /// `host:port`.
    pub fn origin(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    /// Open a session that can be reused for several calls.
    pub async fn connect(&self) -> Result<ElectrumSession<TlsStream<TcpStream>>, ProtocolError> {
        let origin = self.origin();
        let io_timeout = self.config.timeout;
        let fail = |detail: String| ProtocolError::new(origin.clone(), "connect", detail);

        let tcp = match timeout(
            io_timeout,
            TcpStream::connect((self.config.host.as_str(), self.config.port)),
        )
        .await
        {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => return Err(fail(format!("tcp connect failed: {e}"))),
            Err(_) => return Err(fail(format!("tcp connect timed out after {io_timeout:?}"))),
        };
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(%origin, error = %e, "could not disable nagle on electrum socket");
        }

        let server_name = ServerName::try_from(self.config.host.as_str())
            .map(|name| name.to_owned())
            .map_err(|e| fail(format!("invalid server name: {e}")))?;
        let tls = match timeout(io_timeout, self.connector.connect(server_name, tcp)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => return Err(fail(format!("tls handshake failed: {e}"))),
            Err(_) => return Err(fail(format!("tls handshake timed out after {io_timeout:?}"))),
        };
        debug!(%origin, "electrum connected");
        Ok(ElectrumSession::new(tls, origin, io_timeout))
    }

    /// One-shot spend lookup over a fresh connection.
    pub async fn find_spending_transaction(
        &self,
        outpoint: &OutPoint,
        script_pub_key: &Script,
    ) -> Result<Option<Txid>, ProtocolError> {
        self.connect()
            .await?
            .find_spending_transaction(outpoint, script_pub_key)
            .await
    }

    /// One-shot verbose fetch over a fresh connection.
    pub async fn get_transaction_verbose(
        &self,
        txid: &Txid,
    ) -> Result<Option<ResolvedTransaction>, ProtocolError> {
        self.connect().await?.get_transaction_verbose(txid).await
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.connect().await?.ping().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use rcgen::{generate_simple_self_signed, CertifiedKey};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    use super::*;
    use crate::test_util::{p2wpkh_script, txid_from_byte};

    /// Scripted answers for one spend lookup: `creating` funds the outpoint,
    /// `spender` spends it, and every txid in `malformed` comes back as a
    /// body that does not parse.
    #[derive(Clone)]
    struct SpendScenario {
        creating: Txid,
        spender: Txid,
        malformed: Vec<Txid>,
        script: ScriptBuf,
    }

    impl SpendScenario {
        fn new() -> Self {
            Self {
                creating: txid_from_byte(1),
                spender: txid_from_byte(3),
                malformed: Vec::new(),
                script: p2wpkh_script(4),
            }
        }

        fn outpoint(&self) -> OutPoint {
            OutPoint::new(self.creating, 0)
        }

        fn answer(&self, line: &str) -> String {
            let req: serde_json::Value = serde_json::from_str(line).expect("client sends JSON");
            let id = req["id"].clone();
            let result = match req["method"].as_str().expect("method") {
                "blockchain.scripthash.subscribe" => serde_json::json!("status"),
                "blockchain.scripthash.get_history" => {
                    let mut entries = vec![serde_json::json!({ "tx_hash": self.creating.to_string(), "height": 10 })];
                    for txid in self.malformed.iter().chain([&self.spender]) {
                        entries.push(serde_json::json!({ "tx_hash": txid.to_string(), "height": 11 }));
                    }
                    serde_json::Value::Array(entries)
                }
                "blockchain.transaction.get" => {
                    let asked: Txid = req["params"][0].as_str().expect("txid").parse().expect("hex");
                    if self.malformed.contains(&asked) {
                        serde_json::json!({ "txid": asked.to_string(), "vin": "garbage" })
                    } else {
                        serde_json::json!({
                            "txid": asked.to_string(),
                            "vin": [{ "txid": self.creating.to_string(), "vout": 0 }],
                            "vout": [{ "value": 0.1, "n": 0, "scriptPubKey": { "hex": self.script.to_hex_string() } }]
                        })
                    }
                }
                "blockchain.scripthash.unsubscribe" => serde_json::json!(true),
                _ => serde_json::Value::Null,
            };
            let mut out = serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string();
            out.push('\n');
            out
        }
    }

    /// Electrum server on loopback behind a freshly generated self-signed
    /// certificate. Returns the port and a counter of accepted connections.
    async fn spawn_tls_server(scenario: SpendScenario) -> (u16, Arc<AtomicUsize>) {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec!["localhost".to_owned()]).expect("self-signed cert");
        let key = PrivateKeyDer::try_from(key_pair.serialize_der()).expect("pkcs8 key");
        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_no_client_auth()
        .with_single_cert(vec![CertificateDer::from(cert.der().to_vec())], key)
        .expect("server config");
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let port = listener.local_addr().expect("local addr").port();
        let connections = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                let acceptor = acceptor.clone();
                let scenario = scenario.clone();
                tokio::spawn(async move {
                    let Ok(tls) = acceptor.accept(tcp).await else {
                        return;
                    };
                    let (read, mut write) = tokio::io::split(tls);
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if write.write_all(scenario.answer(&line).as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        (port, connections)
    }

    fn loopback_client(port: u16, timeout: Duration) -> ElectrumClient {
        ElectrumClient::new(ElectrumConfig {
            host: "127.0.0.1".to_owned(),
            port,
            timeout,
        })
        .expect("valid config")
    }

    #[tokio::test]
    async fn fresh_and_reused_connections_agree_over_tls() {
        let scenario = SpendScenario::new();
        let (port, connections) = spawn_tls_server(scenario.clone()).await;
        let client = loopback_client(port, Duration::from_secs(5));

        let fresh = client
            .find_spending_transaction(&scenario.outpoint(), &scenario.script)
            .await
            .expect("self-signed certificate is accepted");

        let mut session = client.connect().await.expect("session opens");
        let reused_first = session
            .find_spending_transaction(&scenario.outpoint(), &scenario.script)
            .await
            .expect("first lookup on session");
        let reused_second = session
            .find_spending_transaction(&scenario.outpoint(), &scenario.script)
            .await
            .expect("second lookup on session");
        session.ping().await.expect("session still usable");

        assert_eq!(fresh, Some(scenario.spender));
        assert_eq!(reused_first, fresh);
        assert_eq!(reused_second, fresh);
        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn silent_server_times_out_during_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let port = listener.local_addr().expect("local addr").port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((tcp, _)) = listener.accept().await {
                held.push(tcp);
            }
        });

        let err = loopback_client(port, Duration::from_millis(200))
            .ping()
            .await
            .err()
            .expect("no TLS handshake ever arrives");
        assert_eq!(err.method, "connect");
        assert!(err.detail.contains("tls handshake timed out"));
    }

    #[tokio::test]
    async fn malformed_candidate_is_skipped() {
        let mut scenario = SpendScenario::new();
        scenario.malformed = vec![txid_from_byte(2)];
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server_side = scenario.clone();
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if write.write_all(server_side.answer(&line).as_bytes()).await.is_err() {
                    return;
                }
            }
        });

        let found = ElectrumSession::new(client, "fake:50002", Duration::from_secs(5))
            .find_spending_transaction(&scenario.outpoint(), &scenario.script)
            .await
            .expect("bad candidate does not end the lookup");
        assert_eq!(found, Some(scenario.spender));
    }

    #[tokio::test]
    async fn oversized_line_is_a_protocol_error() {
        let (client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let _ = server.write_all(&[b'x'; 512]).await;
            // Keep the pipe open so only the cap can end the read.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = ElectrumSession::new(client, "fake:50002", Duration::from_secs(2))
            .with_max_line_bytes(64)
            .ping()
            .await
            .expect_err("line over the cap");
        assert!(err.detail.contains("exceeds 64 bytes"));
    }
}
