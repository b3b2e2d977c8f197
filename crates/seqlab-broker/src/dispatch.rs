//! One-shot request dispatch.
//!
//! A [`Broker`] consumes exactly one framed request from its reader,
//! authenticates, drops privilege into the request's scope, runs the
//! single handler and exits. Structural validation happens before the
//! identity store is ever consulted, and the privilege drop happens
//! before any handler touches the filesystem.

use std::path::Path;

use log::{info, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroize;

use seqlab_protocol::{frame, Deadline, Opcode, Request};

use crate::auth::{self, CredentialVerifier, Credentials};
use crate::config::BrokerConfig;
use crate::describe::{DescribeScope, SequenceCatalog};
use crate::error::{BrokerError, BrokerResult};
use crate::exec;
use crate::fsops::{self, EntryKind};
use crate::privilege::{drop_to, PrivilegeMode, ScopedPath};
use crate::transfer;

/// A single-use broker bound to one transport pair.
pub struct Broker<R, W, V, C> {
    reader: R,
    writer: W,
    cfg: BrokerConfig,
    verifier: V,
    catalog: C,
    mode: PrivilegeMode,
}

impl<R, W, V, C> Broker<R, W, V, C>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    V: CredentialVerifier,
    C: SequenceCatalog,
{
    pub fn new(
        reader: R,
        writer: W,
        cfg: BrokerConfig,
        verifier: V,
        catalog: C,
        mode: PrivilegeMode,
    ) -> Self {
        Self {
            reader,
            writer,
            cfg,
            verifier,
            catalog,
            mode,
        }
    }

    /// Serve exactly one request, then the process is done.
    pub async fn run(mut self) -> BrokerResult<()> {
        let deadline = Deadline::after(self.cfg.frame_timeout());
        let mut payload = frame::receive(&mut self.reader, &deadline).await?;
        let parsed = Request::parse(&payload);
        // The raw frame holds the password; wipe it whether or not
        // parsing succeeded.
        payload.zeroize();
        let mut request = parsed?;

        // On the error path the Zeroizing drop wipes the buffer; on
        // success nothing after this point needs the secret.
        let creds = auth::authenticate(
            &self.verifier,
            &request.username,
            &request.password,
            &self.cfg.auth,
        )?;
        request.password.zeroize();
        info!(
            "'{}' (uid {}) authorized for {}",
            request.username, creds.uid, request.opcode
        );

        match request.opcode {
            Opcode::Authenticate => self.handle_authenticate(&request, &creds).await,
            Opcode::RunInteractive | Opcode::RunBatch => {
                self.handle_run(&request, &creds).await
            }
            Opcode::MakeDir => {
                let name = self.enter_target(&request, &creds)?;
                fsops::create_dir(&name)?;
                self.ack().await
            }
            Opcode::DeleteFile => {
                let name = self.enter_target(&request, &creds)?;
                fsops::delete_file(&name)?;
                self.ack().await
            }
            Opcode::DeleteDir => {
                let name = self.enter_target(&request, &creds)?;
                fsops::delete_dir(&name)?;
                self.ack().await
            }
            Opcode::Rename => self.handle_rename(&request, &creds).await,
            Opcode::ListFiles => self.handle_list(&request, &creds, EntryKind::Files).await,
            Opcode::ListDirs => self.handle_list(&request, &creds, EntryKind::Dirs).await,
            Opcode::GetFile => {
                let name = self.enter_target(&request, &creds)?;
                transfer::get_file(
                    &mut self.writer,
                    &name,
                    self.cfg.frame_timeout(),
                    self.cfg.get_stall(),
                )
                .await
            }
            Opcode::PutFile => {
                let name = self.enter_target(&request, &creds)?;
                transfer::put_file(
                    &mut self.reader,
                    &mut self.writer,
                    &name,
                    self.cfg.frame_timeout(),
                    self.cfg.put_stall(),
                    self.cfg.max_put_bytes,
                )
                .await
            }
            Opcode::DescribeSequence => {
                self.handle_describe(&request, &creds, DescribeScope::Sequence)
                    .await
            }
            Opcode::DescribeSequenceSet => {
                self.handle_describe(&request, &creds, DescribeScope::SequenceSet)
                    .await
            }
        }
    }

    /// Drop into the directory containing the request's target path
    /// and hand back the bare name the handler may touch.
    fn enter_target(&self, request: &Request, creds: &Credentials) -> BrokerResult<String> {
        let scoped = ScopedPath::new(&request.args[0])?;
        drop_to(&request.username, creds, &scoped.dir, self.mode)?;
        Ok(scoped.name)
    }

    /// Drop into a directory the request names directly.
    fn enter_dir(&self, raw: &str, request: &Request, creds: &Credentials) -> BrokerResult<()> {
        let dir = ScopedPath::whole_dir(raw)?;
        drop_to(&request.username, creds, &dir, self.mode)
    }

    async fn ack(&mut self) -> BrokerResult<()> {
        let deadline = Deadline::after(self.cfg.frame_timeout());
        frame::send(&mut self.writer, b"OK", &deadline).await?;
        Ok(())
    }

    async fn reply(&mut self, payload: &[u8]) -> BrokerResult<()> {
        let deadline = Deadline::after(self.cfg.frame_timeout());
        frame::send(&mut self.writer, payload, &deadline).await?;
        Ok(())
    }

    /// Verify only. The identity drop still happens, but the process
    /// confines itself to the filesystem root rather than the home
    /// directory, so an account whose home does not exist yet still
    /// resolves.
    async fn handle_authenticate(
        &mut self,
        request: &Request,
        creds: &Credentials,
    ) -> BrokerResult<()> {
        drop_to(&request.username, creds, Path::new("/"), self.mode)?;
        let home = creds.home.display().to_string();
        self.reply(home.as_bytes()).await
    }

    async fn handle_run(&mut self, request: &Request, creds: &Credentials) -> BrokerResult<()> {
        let argv = exec::split_cmdline(&request.args[0])?;
        let env = exec::parse_env_block(&request.args[1])?;
        self.enter_dir(&request.args[2], request, creds)?;

        let deadline = Deadline::after(self.cfg.exec_timeout());
        let result = exec::spawn_and_capture(&argv, &env, &deadline).await?;
        if !result.status.success() {
            warn!("'{}' exited {}", argv[0], result.status);
        }

        match request.opcode {
            Opcode::RunBatch => {
                exec::write_sentinel(&self.cfg.sentinel_name)?;
                Ok(())
            }
            _ => self.relay(&result).await,
        }
    }

    /// Write the accumulators verbatim to the inherited streams. The
    /// transport writer is the broker's stdout, so captured stdout
    /// goes there unframed; captured stderr goes to the broker's own
    /// stderr.
    async fn relay(&mut self, result: &exec::CaptureResult) -> BrokerResult<()> {
        let deadline = Deadline::after(self.cfg.frame_timeout());
        deadline
            .bound(async {
                self.writer.write_all(&result.stdout).await?;
                self.writer.flush().await?;
                let mut err = tokio::io::stderr();
                err.write_all(&result.stderr).await?;
                err.flush().await
            })
            .await
            .map_err(|e| BrokerError::Timeout(format!("relaying output: {e}")))?
            .map_err(|e| BrokerError::Protocol(format!("relaying output: {e}")))?;
        Ok(())
    }

    async fn handle_rename(&mut self, request: &Request, creds: &Credentials) -> BrokerResult<()> {
        let old = ScopedPath::new(&request.args[0])?;
        let new = ScopedPath::new(&request.args[1])?;
        if old.dir != new.dir {
            return Err(BrokerError::Privilege(format!(
                "rename crosses directories: '{}' vs '{}'",
                old.dir.display(),
                new.dir.display()
            )));
        }
        drop_to(&request.username, creds, &old.dir, self.mode)?;
        fsops::rename(&old.name, &new.name)?;
        self.ack().await
    }

    async fn handle_list(
        &mut self,
        request: &Request,
        creds: &Credentials,
        kind: EntryKind,
    ) -> BrokerResult<()> {
        self.enter_dir(&request.args[0], request, creds)?;
        let names = fsops::list_entries(Path::new("."), kind)?;
        self.reply(names.join("\n").as_bytes()).await
    }

    async fn handle_describe(
        &mut self,
        request: &Request,
        creds: &Credentials,
        scope: DescribeScope,
    ) -> BrokerResult<()> {
        let home = creds.home.clone();
        drop_to(&request.username, creds, &home, self.mode)?;
        let info = self.catalog.describe(&request.args[0], scope).await?;
        self.reply(info.reply().as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    use crate::describe::SequenceInfo;

    // Handlers chdir after the privilege drop, so tests touching the
    // working directory take this lock. The guard restores the cwd on
    // drop; otherwise the process is left inside a deleted tempdir and
    // later tests spawning children see a broken working directory.
    static CWD_LOCK: Mutex<()> = Mutex::new(());

    struct CwdGuard(#[allow(dead_code)] std::sync::MutexGuard<'static, ()>);

    impl Drop for CwdGuard {
        fn drop(&mut self) {
            let _ = std::env::set_current_dir(env!("CARGO_MANIFEST_DIR"));
        }
    }

    fn cwd_guard() -> CwdGuard {
        CwdGuard(CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner()))
    }

    struct StubVerifier {
        home: PathBuf,
        calls: Arc<AtomicU32>,
    }

    impl StubVerifier {
        fn new(home: impl Into<PathBuf>) -> Self {
            Self {
                home: home.into(),
                calls: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    impl CredentialVerifier for StubVerifier {
        fn verify(&self, _u: &str, password: &str) -> anyhow::Result<Option<Credentials>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if password != "sesame" {
                return Ok(None);
            }
            Ok(Some(Credentials {
                uid: 1500,
                gid: 1500,
                home: self.home.clone(),
            }))
        }
    }

    struct StubCatalog;

    impl SequenceCatalog for StubCatalog {
        async fn describe(&self, id: &str, scope: DescribeScope) -> BrokerResult<SequenceInfo> {
            if id == "missing" {
                return Err(BrokerError::Describe("unknown identifier".to_string()));
            }
            Ok(SequenceInfo {
                length: 42,
                total_weight: 13000.5,
                is_nucleotide: scope == DescribeScope::Sequence,
            })
        }
    }

    type TestBroker = Broker<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>, StubVerifier, StubCatalog>;

    fn broker_pair(home: &Path) -> (TestBroker, DuplexStream) {
        let (broker_side, peer_side) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(broker_side);
        let broker = Broker::new(
            r,
            w,
            BrokerConfig::default(),
            StubVerifier::new(home),
            StubCatalog,
            PrivilegeMode::Unprivileged,
        );
        (broker, peer_side)
    }

    fn request(header: &str, args: &[&str]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(header.as_bytes());
        payload.push(0);
        for arg in args {
            payload.extend_from_slice(arg.as_bytes());
            payload.push(0);
        }
        payload
    }

    async fn send_request(peer: &mut DuplexStream, header: &str, args: &[&str]) {
        let deadline = Deadline::after(Duration::from_secs(5));
        frame::send(peer, &request(header, args), &deadline)
            .await
            .unwrap();
    }

    async fn read_reply(peer: &mut DuplexStream) -> Vec<u8> {
        let deadline = Deadline::after(Duration::from_secs(5));
        frame::receive(peer, &deadline).await.unwrap()
    }

    #[tokio::test]
    async fn authenticate_replies_with_home() {
        let _guard = cwd_guard();
        let home = tempfile::tempdir().unwrap();
        let (broker, mut peer) = broker_pair(home.path());

        send_request(&mut peer, "1 alice sesame", &[]).await;
        let (run, reply) = tokio::join!(broker.run(), read_reply(&mut peer));
        run.unwrap();
        assert_eq!(reply, home.path().display().to_string().as_bytes());
    }

    #[tokio::test]
    async fn authenticate_succeeds_when_home_is_absent() {
        let _guard = cwd_guard();
        let missing = PathBuf::from("/nonexistent/home/alice");
        let (broker, mut peer) = broker_pair(&missing);

        send_request(&mut peer, "1 alice sesame", &[]).await;
        let (run, reply) = tokio::join!(broker.run(), read_reply(&mut peer));
        run.unwrap();
        assert_eq!(reply, missing.display().to_string().as_bytes());
    }

    #[tokio::test]
    async fn wrong_password_is_an_auth_error() {
        let _guard = cwd_guard();
        let home = tempfile::tempdir().unwrap();
        let (broker, mut peer) = broker_pair(home.path());

        send_request(&mut peer, "1 alice wrong", &[]).await;
        let err = broker.run().await.unwrap_err();
        assert!(matches!(err, BrokerError::Auth(_)));
    }

    #[tokio::test]
    async fn malformed_request_never_reaches_the_verifier() {
        let home = tempfile::tempdir().unwrap();
        let (broker_side, mut peer) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(broker_side);
        let verifier = StubVerifier::new(home.path());
        let calls = Arc::clone(&verifier.calls);
        let broker = Broker::new(
            r,
            w,
            BrokerConfig::default(),
            verifier,
            StubCatalog,
            PrivilegeMode::Unprivileged,
        );

        // Bad opcode, so parsing fails before authentication.
        send_request(&mut peer, "99 alice sesame", &[]).await;
        let err = broker.run().await.unwrap_err();
        assert!(matches!(err, BrokerError::Protocol(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn make_dir_and_list_dirs_round_trip() {
        let _guard = cwd_guard();
        let home = tempfile::tempdir().unwrap();
        let target = home.path().join("results");

        let (broker, mut peer) = broker_pair(home.path());
        send_request(&mut peer, "4 alice sesame", &[target.to_str().unwrap()]).await;
        let (run, reply) = tokio::join!(broker.run(), read_reply(&mut peer));
        run.unwrap();
        assert_eq!(reply, b"OK");
        assert!(target.is_dir());

        let (broker, mut peer) = broker_pair(home.path());
        send_request(&mut peer, "9 alice sesame", &[home.path().to_str().unwrap()]).await;
        let (run, reply) = tokio::join!(broker.run(), read_reply(&mut peer));
        run.unwrap();
        assert_eq!(reply, b"results");
    }

    #[tokio::test]
    async fn rename_refuses_to_cross_directories() {
        let _guard = cwd_guard();
        let home = tempfile::tempdir().unwrap();
        let (broker, mut peer) = broker_pair(home.path());

        send_request(
            &mut peer,
            "7 alice sesame",
            &["/home/alice/a", "/home/bob/b"],
        )
        .await;
        let err = broker.run().await.unwrap_err();
        assert!(matches!(err, BrokerError::Privilege(_)));
    }

    #[tokio::test]
    async fn describe_sequence_replies_formatted_info() {
        let _guard = cwd_guard();
        let home = tempfile::tempdir().unwrap();
        let (broker, mut peer) = broker_pair(home.path());

        send_request(&mut peer, "12 alice sesame", &["NM_000546"]).await;
        let (run, reply) = tokio::join!(broker.run(), read_reply(&mut peer));
        run.unwrap();
        assert_eq!(reply, b"42 13000.5 nuc");
    }

    #[tokio::test]
    async fn describe_failure_maps_to_describe_error() {
        let _guard = cwd_guard();
        let home = tempfile::tempdir().unwrap();
        let (broker, mut peer) = broker_pair(home.path());

        send_request(&mut peer, "12 alice sesame", &["missing"]).await;
        let err = broker.run().await.unwrap_err();
        assert!(matches!(err, BrokerError::Describe(_)));
    }
}
