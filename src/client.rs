use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::{
    caching::CapabilityCache,
    command::{CommandRecord, Token},
    error::Result,
    multiplexer::Multiplexer,
    pending::{ConnectionState, PendingReply},
    probe::{ProbeInput, ProbeOutcome},
    process::ProcessHandle,
    resolve::{self, IpVersion, ResolveStrategy, ResolvedHost},
    response::ReplyRecord,
    task::BackgroundTask,
};

pub const DEFAULT_EXECUTABLE: &str = "mtr-packet";
pub const EXECUTABLE_ENV: &str = "MTR_PACKET";

/// Settings for launching the daemon.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub executable: String,
    pub command_prefix: Vec<String>,
    pub resolve_strategy: ResolveStrategy,
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    executable: Option<String>,
    command_prefix: Vec<String>,
    resolve_strategy: ResolveStrategy,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientConfigBuilder {
    /// Starts from `mtr-packet`, or from `$MTR_PACKET` when it is set.
    pub fn new() -> Self {
        Self {
            executable: std::env::var(EXECUTABLE_ENV)
                .ok()
                .filter(|executable| !executable.is_empty()),
            command_prefix: Vec::new(),
            resolve_strategy: ResolveStrategy::default(),
        }
    }

    /// Path or name of the daemon. Overrides `$MTR_PACKET`.
    pub fn with_executable(mut self, executable: &str) -> Self {
        self.executable = Some(executable.into());
        self
    }

    /// Runs the daemon through a wrapper, e.g. `["ip", "netns", "exec", "blue"]`.
    pub fn with_command_prefix<I, S>(mut self, prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command_prefix = prefix.into_iter().map(Into::into).collect();
        self
    }

    /// Same as [`Self::with_command_prefix`], splitting on whitespace.
    pub fn with_command_prefix_str(self, prefix: &str) -> Self {
        self.with_command_prefix(prefix.split_whitespace())
    }

    /// Chooses who turns host names into addresses. Defaults to
    /// [`ResolveStrategy::System`].
    pub fn with_resolve_strategy(mut self, strategy: ResolveStrategy) -> Self {
        self.resolve_strategy = strategy;
        self
    }

    /// Builds the [`ClientConfig`], falling back to `mtr-packet` when no
    /// executable was given.
    pub fn build(self) -> ClientConfig {
        ClientConfig {
            executable: self
                .executable
                .unwrap_or_else(|| DEFAULT_EXECUTABLE.into()),
            command_prefix: self.command_prefix,
            resolve_strategy: self.resolve_strategy,
        }
    }
}

/// A connection to one `mtr-packet` process.
///
/// Any number of probes may be in flight at once over the same process;
/// each call waits only for its own reply. The process is killed when the
/// client is closed or dropped.
///
/// # Example
/// ```no_run
/// use async_mtr::{Client, ClientConfigBuilder, ProbeInputBuilder};
///
/// tokio_test::block_on(async {
///     let client = Client::new(ClientConfigBuilder::new().build()).unwrap();
///     let input = ProbeInputBuilder::new()
///         .with_target("8.8.8.8")
///         .with_ttl(8)
///         .build()
///         .unwrap();
///     let outcome = client.probe(&input).await.unwrap();
///     println!("{} from {:?} in {:?} ms", outcome.result, outcome.responder, outcome.time_ms);
///     client.close().await;
/// })
/// ```
#[derive(Debug)]
pub struct Client {
    mux: Multiplexer,
    capabilities: CapabilityCache,
    resolve_strategy: ResolveStrategy,
    supervisor: BackgroundTask,
}

impl Client {
    /// Launches the probe daemon and starts listening to its replies.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    /// Returns [`crate::Error::Launch`] if the process cannot be started.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let (process, stdin, stdout) =
            ProcessHandle::start(&config.executable, &config.command_prefix)?;

        let exited = CancellationToken::new();
        let supervisor = BackgroundTask::new();
        let supervisor_exited = exited.clone();
        supervisor.spawn(move |shutdown| process.supervise(shutdown, supervisor_exited));

        Ok(Self {
            mux: Multiplexer::new(stdout, stdin, exited),
            capabilities: CapabilityCache::new(),
            resolve_strategy: config.resolve_strategy,
            supervisor,
        })
    }

    /// Speaks the protocol over an already established byte stream pair
    /// instead of a spawned process. Launch settings in `config` are ignored.
    pub fn with_transport<R, W>(reader: R, writer: W, config: ClientConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            mux: Multiplexer::new(reader, writer, CancellationToken::new()),
            capabilities: CapabilityCache::new(),
            resolve_strategy: config.resolve_strategy,
            supervisor: BackgroundTask::new(),
        }
    }

    /// Current lifecycle state of the connection.
    pub fn state(&self) -> ConnectionState {
        self.mux.state()
    }

    /// Sends a probe and waits for its outcome.
    ///
    /// The target is resolved first and every optional parameter is checked
    /// against the daemon's capabilities, so nothing is sent if either fails.
    ///
    /// # Errors
    /// [`crate::Error::HostResolve`] if the target cannot be resolved,
    /// [`crate::Error::UnsupportedFeature`] if the daemon lacks a requested
    /// parameter, [`crate::Error::Process`] if the daemon is gone and
    /// [`crate::Error::Protocol`] if its reply cannot be decoded.
    pub async fn probe(&self, input: &ProbeInput) -> Result<ProbeOutcome> {
        let target = self.resolve(&input.target, input.ip_version).await?;
        for feature in input.required_features(&target) {
            self.ensure_supported(feature).await?;
        }
        let reply = self.mux.submit(&input.to_command(&target)).await?;
        Ok(ProbeOutcome::from(reply.body))
    }

    /// Sends all probes concurrently; outcomes keep the order of `inputs`.
    pub async fn probe_batch(&self, inputs: &[ProbeInput]) -> Vec<Result<ProbeOutcome>> {
        futures::future::join_all(inputs.iter().map(|input| self.probe(input))).await
    }

    /// Resolves `host` to an address, optionally of one family only.
    ///
    /// Address literals are returned without contacting anybody.
    pub async fn resolve(&self, host: &str, ip_version: Option<IpVersion>) -> Result<ResolvedHost> {
        resolve::resolve(&self.mux, self.resolve_strategy, host, ip_version).await
    }

    /// Asks the daemon whether it supports `feature`, once per connection.
    pub async fn check_support(&self, feature: &str) -> Result<bool> {
        self.capabilities.check(&self.mux, feature).await
    }

    /// Fails with [`crate::Error::UnsupportedFeature`] unless the daemon
    /// supports `feature`.
    pub async fn ensure_supported(&self, feature: &str) -> Result<()> {
        self.capabilities.ensure(&self.mux, feature).await
    }

    /// Sends a raw command and waits for its reply.
    pub async fn submit(&self, command: &CommandRecord) -> Result<ReplyRecord> {
        self.mux.submit(command).await
    }

    /// Sends a raw command; the returned handle resolves with its reply.
    pub async fn issue(&self, command: &CommandRecord) -> Result<PendingReply> {
        self.mux.issue(command).await
    }

    /// Forgets the request with `token`. A late reply for it is discarded.
    pub fn cancel(&self, token: Token) -> bool {
        self.mux.cancel(token)
    }

    /// Terminates the daemon and fails every request still outstanding.
    ///
    /// Returns even when the daemon has stopped reading its input.
    pub async fn close(&self) {
        if self.mux.state() == ConnectionState::Closed {
            return;
        }
        debug!("closing connection");
        self.mux.begin_close();
        // Killing the process first turns a write stuck on a full pipe into an error.
        self.supervisor.cancel();
        self.supervisor.join().await;
        self.mux.close_input().await;
        self.mux.shutdown("connection closed").await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        net::IpAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use tokio::{
        io::{split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream},
        sync::mpsc,
    };

    use super::*;
    use crate::{error::Error, probe::ProbeInputBuilder};

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    #[derive(Debug)]
    struct ReceivedCommand {
        name: String,
        args: HashMap<String, String>,
    }

    fn parse_command(line: &str) -> (String, ReceivedCommand) {
        let atoms: Vec<&str> = line.trim().split(' ').collect();
        let args = atoms[2..]
            .chunks(2)
            .filter(|pair| pair.len() == 2)
            .map(|pair| (pair[0].to_string(), pair[1].to_string()))
            .collect();
        (
            atoms[0].to_string(),
            ReceivedCommand {
                name: atoms[1].to_string(),
                args,
            },
        )
    }

    /// Stands in for `mtr-packet`: answers `check-support` on its own and
    /// every other command with the next canned reply body.
    struct FakeDaemon {
        commands: mpsc::UnboundedReceiver<ReceivedCommand>,
        replies: mpsc::UnboundedSender<&'static str>,
        support_queries: Arc<AtomicUsize>,
    }

    impl FakeDaemon {
        fn spawn(io: DuplexStream, unsupported: &'static [&'static str]) -> Self {
            let (commands_tx, commands) = mpsc::unbounded_channel();
            let (replies, mut replies_rx) = mpsc::unbounded_channel::<&'static str>();
            let support_queries = Arc::new(AtomicUsize::new(0));
            let queries = Arc::clone(&support_queries);
            tokio::spawn(async move {
                let (reader, mut writer) = split(io);
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let (token, command) = parse_command(&line);
                    let body = if command.name == "check-support" {
                        queries.fetch_add(1, Ordering::SeqCst);
                        let feature = command.args["feature"].as_str();
                        if unsupported.iter().any(|unsupported| *unsupported == feature) {
                            "feature-support support no"
                        } else {
                            "feature-support support ok"
                        }
                    } else {
                        let _ = commands_tx.send(command);
                        match replies_rx.recv().await {
                            Some(body) => body,
                            None => break,
                        }
                    };
                    let reply = format!("{} {}\n", token, body);
                    if writer.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
            Self {
                commands,
                replies,
                support_queries,
            }
        }

        async fn next_command(&mut self) -> ReceivedCommand {
            tokio::time::timeout(TEST_TIMEOUT, self.commands.recv())
                .await
                .unwrap()
                .unwrap()
        }
    }

    fn connect(strategy: ResolveStrategy, unsupported: &'static [&'static str]) -> (Client, FakeDaemon) {
        let (client_io, daemon_io) = tokio::io::duplex(4096);
        let (reader, writer) = split(client_io);
        let config = ClientConfigBuilder::new()
            .with_resolve_strategy(strategy)
            .build();
        (
            Client::with_transport(reader, writer, config),
            FakeDaemon::spawn(daemon_io, unsupported),
        )
    }

    fn input(target: &str) -> ProbeInputBuilder {
        ProbeInputBuilder::new().with_target(target)
    }

    fn ip(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    #[tokio::test]
    async fn test_probe_commands() {
        let (client, mut daemon) = connect(ResolveStrategy::System, &[]);

        daemon.replies.send("reply ip-4 8.8.4.4 round-trip-time 1000").unwrap();
        let outcome = client
            .probe(&input("8.8.8.8").with_bit_pattern(42).build().unwrap())
            .await
            .unwrap();
        let command = daemon.next_command().await;
        assert_eq!(command.name, "send-probe");
        assert_eq!(command.args["ip-4"], "8.8.8.8");
        assert_eq!(command.args["bit-pattern"], "42");
        assert!(outcome.success);
        assert_eq!(outcome.responder, Some(ip("8.8.4.4")));
        assert_eq!(outcome.time_ms, Some(1.0));

        daemon.replies.send("reply ip-4 127.0.1.1 round-trip-time 500").unwrap();
        let outcome = client
            .probe(&input("127.0.1.1").with_local_ip(ip("127.0.0.1")).build().unwrap())
            .await
            .unwrap();
        let command = daemon.next_command().await;
        assert_eq!(command.args["ip-4"], "127.0.1.1");
        assert_eq!(command.args["local-ip-4"], "127.0.0.1");
        assert!(outcome.success);
        assert_eq!(outcome.time_ms, Some(0.5));

        daemon.replies.send("no-reply").unwrap();
        let outcome = client
            .probe(&input("::1").with_ttl(4).build().unwrap())
            .await
            .unwrap();
        let command = daemon.next_command().await;
        assert_eq!(command.args["ip-6"], "::1");
        assert_eq!(command.args["ttl"], "4");
        assert!(!outcome.success);
        assert_eq!(outcome.result, "no-reply");
        assert_eq!(outcome.responder, None);
        assert_eq!(outcome.time_ms, None);

        daemon.replies.send("ttl-expired ip-4 8.0.0.1 mpls 1,2,0,3,4,5,1,6").unwrap();
        let outcome = client.probe(&input("8.8.9.9").build().unwrap()).await.unwrap();
        daemon.next_command().await;
        assert_eq!(outcome.mpls.len(), 2);
        assert_eq!(outcome.mpls[0].label, 1);
        assert_eq!(outcome.mpls[0].traffic_class, 2);
        assert!(!outcome.mpls[0].bottom_of_stack);
        assert_eq!(outcome.mpls[0].ttl, 3);
        assert_eq!(outcome.mpls[1].label, 4);
        assert_eq!(outcome.mpls[1].traffic_class, 5);
        assert!(outcome.mpls[1].bottom_of_stack);
        assert_eq!(outcome.mpls[1].ttl, 6);
    }

    #[tokio::test]
    async fn test_probe_resolved_by_daemon() {
        let (client, mut daemon) = connect(ResolveStrategy::Daemon, &[]);
        daemon.replies.send("dns-reply ip-6 ::1").unwrap();
        daemon.replies.send("reply ip-6 ::1 round-trip-time 1000").unwrap();
        let outcome = client
            .probe(
                &input("ip6-localhost")
                    .with_ip_version(IpVersion::V6)
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();

        let resolution = daemon.next_command().await;
        assert_eq!(resolution.name, "dns-resolve");
        assert_eq!(resolution.args["hostname"], "ip6-localhost");
        assert_eq!(resolution.args["ip-version"], "6");
        let probe = daemon.next_command().await;
        assert_eq!(probe.name, "send-probe");
        assert_eq!(probe.args["ip-6"], "::1");
        assert!(outcome.success);
        assert_eq!(outcome.responder, Some(ip("::1")));
    }

    #[tokio::test]
    async fn test_unresolvable_host_sends_no_probe() {
        let (client, mut daemon) = connect(ResolveStrategy::System, &[]);
        let result = client.probe(&input("host.invalid").build().unwrap()).await;
        assert!(matches!(result, Err(Error::HostResolve(host)) if host == "host.invalid"));

        daemon.replies.send("no-reply").unwrap();
        client.probe(&input("192.0.2.7").build().unwrap()).await.unwrap();
        assert_eq!(daemon.next_command().await.args["ip-4"], "192.0.2.7");
    }

    #[tokio::test]
    async fn test_daemon_resolution_failure_sends_no_probe() {
        let (client, mut daemon) = connect(ResolveStrategy::Daemon, &[]);
        daemon.replies.send("no-reply").unwrap();
        let result = client.probe(&input("nowhere.test").build().unwrap()).await;
        assert!(matches!(result, Err(Error::HostResolve(_))));
        assert_eq!(daemon.next_command().await.name, "dns-resolve");

        daemon.replies.send("no-reply").unwrap();
        client.probe(&input("192.0.2.7").build().unwrap()).await.unwrap();
        assert_eq!(daemon.next_command().await.name, "send-probe");
    }

    #[tokio::test]
    async fn test_unsupported_parameter_is_never_sent() {
        let (client, mut daemon) = connect(ResolveStrategy::System, &["mark"]);
        let result = client
            .probe(&input("192.0.2.1").with_mark(3).build().unwrap())
            .await;
        assert!(matches!(result, Err(Error::UnsupportedFeature(feature)) if feature == "mark"));

        daemon.replies.send("no-reply").unwrap();
        client
            .probe(&input("192.0.2.2").with_ttl(2).build().unwrap())
            .await
            .unwrap();
        let command = daemon.next_command().await;
        assert_eq!(command.args["ip-4"], "192.0.2.2");
        assert!(!command.args.contains_key("mark"));
    }

    #[tokio::test]
    async fn test_capabilities_are_queried_once() {
        let (client, daemon) = connect(ResolveStrategy::System, &["sctp"]);
        assert!(client.check_support("udp").await.unwrap());
        assert!(client.check_support("udp").await.unwrap());
        assert!(!client.check_support("sctp").await.unwrap());
        assert!(!client.check_support("sctp").await.unwrap());
        assert_eq!(daemon.support_queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_probe_batch_keeps_input_order() {
        let (client, daemon) = connect(ResolveStrategy::System, &[]);
        daemon.replies.send("reply ip-4 192.0.2.1 round-trip-time 1000").unwrap();
        daemon.replies.send("no-reply").unwrap();
        let inputs = vec![
            input("192.0.2.1").build().unwrap(),
            input("host.invalid").build().unwrap(),
            input("192.0.2.3").build().unwrap(),
        ];
        let outcomes = client.probe_batch(&inputs).await;
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[1], Err(Error::HostResolve(_))));
        let results: Vec<&str> = [0, 2]
            .iter()
            .map(|&i| outcomes[i].as_ref().unwrap().result.as_str())
            .collect();
        assert!(results.contains(&"reply") && results.contains(&"no-reply"));
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_requests() {
        let (client, mut daemon) = connect(ResolveStrategy::System, &[]);
        let command = CommandRecord::new("send-probe").with_arg("ip-4", "192.0.2.1");
        let pending = client.issue(&command).await.unwrap();
        daemon.next_command().await;

        client.close().await;
        assert!(matches!(pending.await, Err(Error::Process(_))));
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(
            client.probe(&input("192.0.2.1").build().unwrap()).await,
            Err(Error::Process(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let config = ClientConfigBuilder::new()
            .with_executable("mtr-packet-missing")
            .build();
        assert!(matches!(Client::new(config), Err(Error::Launch { .. })));
    }

    #[tokio::test]
    async fn test_process_exit() {
        let config = ClientConfigBuilder::new().with_executable("true").build();
        let client = Client::new(config).unwrap();
        let result = tokio::time::timeout(
            TEST_TIMEOUT,
            client.probe(&input("127.0.0.1").build().unwrap()),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(Error::Process(_))));
        while client.state() != ConnectionState::Closed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_process_exit_behind_prefix() {
        let config = ClientConfigBuilder::new()
            .with_command_prefix_str("env")
            .with_executable("true")
            .build();
        let client = Client::new(config).unwrap();
        let result = tokio::time::timeout(
            TEST_TIMEOUT,
            client.probe(&input("::1").build().unwrap()),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(Error::Process(_))));
    }

    #[tokio::test]
    async fn test_close_terminates_process() {
        // Runs `sleep 30`, which never answers.
        let config = ClientConfigBuilder::new()
            .with_command_prefix(["sleep"])
            .with_executable("30")
            .build();
        let client = Client::new(config).unwrap();
        let command = CommandRecord::new("send-probe").with_arg("ip-4", "192.0.2.1");
        let pending = client.issue(&command).await.unwrap();

        tokio::time::timeout(TEST_TIMEOUT, client.close()).await.unwrap();
        assert!(matches!(pending.await, Err(Error::Process(_))));
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_while_daemon_ignores_input() {
        // `sleep 30` never reads, so a line larger than the pipe buffer blocks its writer.
        let config = ClientConfigBuilder::new()
            .with_command_prefix(["sleep"])
            .with_executable("30")
            .build();
        let client = Arc::new(Client::new(config).unwrap());
        let blocked = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let command =
                    CommandRecord::new("check-support").with_arg("feature", "x".repeat(256 * 1024));
                client.issue(&command).await.map(|pending| pending.token())
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(5), client.close())
            .await
            .unwrap();
        assert_eq!(client.state(), ConnectionState::Closed);
        let issued = tokio::time::timeout(TEST_TIMEOUT, blocked).await.unwrap().unwrap();
        assert!(matches!(issued, Err(Error::Process(_))));
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfigBuilder::new()
            .with_executable("/opt/mtr/bin/mtr-packet")
            .with_command_prefix_str("ip netns exec  blue")
            .with_resolve_strategy(ResolveStrategy::Daemon)
            .build();
        assert_eq!(config.executable, "/opt/mtr/bin/mtr-packet");
        assert_eq!(config.command_prefix, vec!["ip", "netns", "exec", "blue"]);
        assert_eq!(config.resolve_strategy, ResolveStrategy::Daemon);
    }
}
