//! In-memory SSH/SFTP fakes for driving `SftpProvider` in tests.
//!
//! The fake server keeps a tiny file tree, records every request it receives
//! and answers the way OpenSSH's SFTP v3 server does: renaming onto an
//! existing path, removing a non-empty directory and creating something
//! that already exists all fail with the generic `Failure` status.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use sftp_provider::{
    AuthMethod, Bytes, Connector, Consumer, Credential, CredentialRequest, Handle, HostKey,
    OpenMode, ProviderConfig, RawAttributes, RawEntry, RemotePath, SftpChannel, SftpFailure,
    SftpProvider, SshTransport, StatusCode, TransportError, async_trait,
};

pub const FINGERPRINT: &str = "SHA256:fakefakefakefakefakefakefakefakefakefakefak";
pub const PASSWORD: &str = "correct horse";
pub const USER: &str = "alice";
pub const HOST: &str = "files.example.com";
pub const PORT: u16 = 2222;

/// One request as seen by the fake server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Authenticate(AuthMethod),
    OpenSftp,
    Disconnect,
    OpenDir(String),
    ReadDir(String),
    Open(String, OpenMode),
    Read(String, u64),
    Close(String),
    Rename(String, String),
    RenameOverwrite(String, String),
    RemoveFile(String),
    RemoveDir(String),
    MakeDir(String),
    Stat(String),
    Shutdown,
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Call::Rename(..) | Call::RenameOverwrite(..) | Call::RemoveFile(_) | Call::RemoveDir(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    File(Vec<u8>),
    Dir,
    Symlink(String),
}

impl Node {
    fn permissions(&self) -> u32 {
        match self {
            Node::File(_) => 0o100644,
            Node::Dir => 0o040755,
            Node::Symlink(_) => 0o120777,
        }
    }

    fn mode_string(&self) -> &'static str {
        match self {
            Node::File(_) => "-rw-r--r--",
            Node::Dir => "drwxr-xr-x",
            Node::Symlink(_) => "lrwxrwxrwx",
        }
    }

    fn size(&self) -> u64 {
        match self {
            Node::File(data) => data.len() as u64,
            Node::Dir => 4096,
            Node::Symlink(target) => target.len() as u64,
        }
    }
}

type Matcher = Box<dyn Fn(&Call) -> bool + Send>;

struct Injection {
    matches: Matcher,
    code: StatusCode,
    /// matching calls let through before this injection fires
    skip: usize,
    /// `None` fires forever
    remaining: Option<usize>,
    hang: bool,
}

enum Verdict {
    Proceed,
    Fail(StatusCode),
    Hang,
}

#[derive(Default)]
struct OpenHandle {
    path: String,
    listed: bool,
}

pub struct ServerState {
    pub nodes: BTreeMap<String, Node>,
    pub calls: Vec<Call>,
    pub atomic_overwrite: bool,
    pub refuse_connections: bool,
    pub accepted_password: Option<String>,
    pub accepted_key: Option<PathBuf>,
    pub connects: usize,
    pub disconnects: usize,
    injections: Vec<Injection>,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
}

impl ServerState {
    fn verdict(&mut self, call: &Call) -> Verdict {
        self.calls.push(call.clone());
        for injection in self.injections.iter_mut() {
            if injection.remaining == Some(0) || !(injection.matches)(call) {
                continue;
            }
            if injection.skip > 0 {
                injection.skip -= 1;
                continue;
            }
            if let Some(n) = injection.remaining.as_mut() {
                *n -= 1;
            }
            return if injection.hang {
                Verdict::Hang
            } else {
                Verdict::Fail(injection.code)
            };
        }
        Verdict::Proceed
    }

    fn children(&self, dir: &str) -> Vec<(String, Node)> {
        self.nodes
            .iter()
            .filter(|(path, _)| path.as_str() != "/" && parent_of(path) == dir)
            .map(|(path, node)| (name_of(path).to_string(), node.clone()))
            .collect()
    }

    fn attrs(node: &Node) -> RawAttributes {
        RawAttributes {
            size: Some(node.size()),
            uid: Some(1000),
            gid: Some(100),
            user: None,
            group: None,
            permissions: Some(node.permissions()),
            atime: Some(1_700_000_100),
            mtime: Some(1_700_000_000),
        }
    }

    fn new_handle(&mut self, path: &str) -> Handle {
        self.next_handle += 1;
        let id = format!("h{}", self.next_handle);
        self.handles.insert(
            id.clone(),
            OpenHandle {
                path: path.to_string(),
                listed: false,
            },
        );
        Handle::new(id)
    }

    fn move_tree(&mut self, from: &str, to: &str) {
        let prefix = format!("{from}/");
        let moved: Vec<String> = self
            .nodes
            .keys()
            .filter(|p| p.as_str() == from || p.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = self.nodes.remove(&old) {
                let new = format!("{to}{}", &old[from.len()..]);
                self.nodes.insert(new, node);
            }
        }
    }

    fn parent_is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.get(parent_of(path)), Some(Node::Dir))
    }
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

fn failure(code: StatusCode) -> SftpFailure {
    SftpFailure::new(code, format!("fake: {code}"))
}

/// Shared handle to the fake server. Clones see the same state.
#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        Self {
            state: Arc::new(Mutex::new(ServerState {
                nodes,
                calls: Vec::new(),
                atomic_overwrite: true,
                refuse_connections: false,
                accepted_password: Some(PASSWORD.to_string()),
                accepted_key: None,
                connects: 0,
                disconnects: 0,
                injections: Vec::new(),
                handles: HashMap::new(),
                next_handle: 0,
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            server: self.clone(),
        })
    }

    pub fn with_dir(self, path: &str) -> Self {
        self.state().nodes.insert(path.to_string(), Node::Dir);
        self
    }

    pub fn with_file(self, path: &str, contents: &[u8]) -> Self {
        self.state()
            .nodes
            .insert(path.to_string(), Node::File(contents.to_vec()));
        self
    }

    pub fn with_symlink(self, path: &str, target: &str) -> Self {
        self.state()
            .nodes
            .insert(path.to_string(), Node::Symlink(target.to_string()));
        self
    }

    pub fn without_atomic_overwrite(self) -> Self {
        self.state().atomic_overwrite = false;
        self
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state().nodes.contains_key(path)
    }

    pub fn node(&self, path: &str) -> Option<Node> {
        self.state().nodes.get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.state().nodes.keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    /// Fails every call `matches` accepts with `code`.
    pub fn fail_when(&self, matches: impl Fn(&Call) -> bool + Send + 'static, code: StatusCode) {
        self.inject(Box::new(matches), code, 0, None, false);
    }

    /// Lets `skip` matching calls through, then fails the next one.
    pub fn fail_after(
        &self,
        skip: usize,
        matches: impl Fn(&Call) -> bool + Send + 'static,
        code: StatusCode,
    ) {
        self.inject(Box::new(matches), code, skip, Some(1), false);
    }

    /// The next matching call never gets a reply.
    pub fn hang_once(&self, matches: impl Fn(&Call) -> bool + Send + 'static) {
        self.inject(Box::new(matches), StatusCode::Ok, 0, Some(1), true);
    }

    /// Lets `skip` matching calls through, then never replies to the next.
    pub fn hang_after(&self, skip: usize, matches: impl Fn(&Call) -> bool + Send + 'static) {
        self.inject(Box::new(matches), StatusCode::Ok, skip, Some(1), true);
    }

    /// Yields until the server has seen a call `matches` accepts.
    pub async fn wait_for(&self, matches: impl Fn(&Call) -> bool) {
        while !self.calls().iter().any(&matches) {
            tokio::task::yield_now().await;
        }
    }

    fn inject(
        &self,
        matches: Matcher,
        code: StatusCode,
        skip: usize,
        remaining: Option<usize>,
        hang: bool,
    ) {
        self.state().injections.push(Injection {
            matches,
            code,
            skip,
            remaining,
            hang,
        });
    }

    async fn request(&self, call: Call) -> Result<(), SftpFailure> {
        let verdict = self.state().verdict(&call);
        match verdict {
            Verdict::Proceed => Ok(()),
            Verdict::Fail(code) => Err(failure(code)),
            Verdict::Hang => std::future::pending().await,
        }
    }
}

struct FakeConnector {
    server: FakeServer,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open_session(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn SshTransport>, TransportError> {
        let mut state = self.server.state();
        if state.refuse_connections {
            return Err(TransportError::new(format!("{host}:{port} refused")));
        }
        state.connects += 1;
        Ok(Box::new(FakeTransport {
            server: self.server.clone(),
        }))
    }
}

struct FakeTransport {
    server: FakeServer,
}

#[async_trait]
impl SshTransport for FakeTransport {
    fn host_key(&self) -> HostKey {
        HostKey {
            algorithm: "ssh-ed25519".to_string(),
            fingerprint: FINGERPRINT.to_string(),
        }
    }

    async fn authenticate(
        &mut self,
        _user: &str,
        credential: &Credential,
    ) -> Result<bool, TransportError> {
        let mut state = self.server.state();
        state.calls.push(Call::Authenticate(credential.method()));
        Ok(match credential {
            Credential::Password(p) => state.accepted_password.as_deref() == Some(p.as_str()),
            Credential::PrivateKey { path, .. } => state.accepted_key.as_ref() == Some(path),
        })
    }

    async fn open_sftp(&mut self) -> Result<Box<dyn SftpChannel>, TransportError> {
        self.server.state().calls.push(Call::OpenSftp);
        Ok(Box::new(FakeChannel {
            server: self.server.clone(),
        }))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut state = self.server.state();
        state.calls.push(Call::Disconnect);
        state.disconnects += 1;
        Ok(())
    }
}

struct FakeChannel {
    server: FakeServer,
}

#[async_trait]
impl SftpChannel for FakeChannel {
    fn supports_atomic_overwrite(&self) -> bool {
        self.server.state().atomic_overwrite
    }

    async fn open_dir(&mut self, path: &str) -> Result<Handle, SftpFailure> {
        self.server.request(Call::OpenDir(path.to_string())).await?;
        let mut state = self.server.state();
        match state.nodes.get(path).cloned() {
            Some(Node::Dir) => Ok(state.new_handle(path)),
            Some(_) => Err(failure(StatusCode::NotADirectory)),
            None => Err(failure(StatusCode::NoSuchFile)),
        }
    }

    async fn read_dir(&mut self, handle: &Handle) -> Result<Option<Vec<RawEntry>>, SftpFailure> {
        let path = match self.server.state().handles.get(handle.as_str()) {
            Some(open) => open.path.clone(),
            None => return Err(failure(StatusCode::InvalidHandle)),
        };
        self.server.request(Call::ReadDir(path.clone())).await?;

        let mut state = self.server.state();
        let already_listed = state
            .handles
            .get(handle.as_str())
            .is_some_and(|open| open.listed);
        if already_listed {
            return Ok(None);
        }
        if let Some(open) = state.handles.get_mut(handle.as_str()) {
            open.listed = true;
        }

        let mut entries = vec![dot_entry("."), dot_entry("..")];
        for (name, node) in state.children(&path) {
            entries.push(RawEntry {
                longname: format!(
                    "{} 1 {} staff {} Nov 14 22:13 {}",
                    node.mode_string(),
                    USER,
                    node.size(),
                    name
                ),
                attrs: ServerState::attrs(&node),
                filename: name,
            });
        }
        Ok(Some(entries))
    }

    async fn open(&mut self, path: &str, mode: OpenMode) -> Result<Handle, SftpFailure> {
        self.server
            .request(Call::Open(path.to_string(), mode))
            .await?;
        let mut state = self.server.state();
        match (mode, state.nodes.get(path).cloned()) {
            (OpenMode::Read, Some(Node::File(_))) => Ok(state.new_handle(path)),
            (OpenMode::Read, Some(_)) => Err(failure(StatusCode::Failure)),
            (OpenMode::Read, None) => Err(failure(StatusCode::NoSuchFile)),
            (OpenMode::CreateNew, Some(_)) => Err(failure(StatusCode::Failure)),
            (OpenMode::CreateNew, None) => {
                if !state.parent_is_dir(path) {
                    return Err(failure(StatusCode::NoSuchFile));
                }
                state.nodes.insert(path.to_string(), Node::File(Vec::new()));
                Ok(state.new_handle(path))
            }
        }
    }

    async fn read(
        &mut self,
        handle: &Handle,
        offset: u64,
        len: u32,
    ) -> Result<Option<Bytes>, SftpFailure> {
        let path = match self.server.state().handles.get(handle.as_str()) {
            Some(open) => open.path.clone(),
            None => return Err(failure(StatusCode::InvalidHandle)),
        };
        self.server.request(Call::Read(path.clone(), offset)).await?;
        let state = self.server.state();
        let Some(Node::File(data)) = state.nodes.get(&path) else {
            return Err(failure(StatusCode::NoSuchFile));
        };
        let start = offset as usize;
        if start >= data.len() {
            return Ok(None);
        }
        let end = (start + len as usize).min(data.len());
        Ok(Some(Bytes::copy_from_slice(&data[start..end])))
    }

    async fn close(&mut self, handle: Handle) -> Result<(), SftpFailure> {
        let path = match self.server.state().handles.remove(handle.as_str()) {
            Some(open) => open.path,
            None => return Err(failure(StatusCode::InvalidHandle)),
        };
        self.server.request(Call::Close(path)).await
    }

    async fn rename(&mut self, from: &str, to: &str) -> Result<(), SftpFailure> {
        self.server
            .request(Call::Rename(from.to_string(), to.to_string()))
            .await?;
        let mut state = self.server.state();
        if !state.nodes.contains_key(from) {
            return Err(failure(StatusCode::NoSuchFile));
        }
        if state.nodes.contains_key(to) {
            return Err(failure(StatusCode::Failure));
        }
        if !state.parent_is_dir(to) {
            return Err(failure(StatusCode::NoSuchFile));
        }
        state.move_tree(from, to);
        Ok(())
    }

    async fn rename_overwrite(&mut self, from: &str, to: &str) -> Result<(), SftpFailure> {
        self.server
            .request(Call::RenameOverwrite(from.to_string(), to.to_string()))
            .await?;
        let mut state = self.server.state();
        if !state.atomic_overwrite {
            return Err(failure(StatusCode::OpUnsupported));
        }
        if !state.nodes.contains_key(from) {
            return Err(failure(StatusCode::NoSuchFile));
        }
        if matches!(state.nodes.get(to), Some(Node::Dir)) && !state.children(to).is_empty() {
            return Err(failure(StatusCode::Failure));
        }
        state.nodes.remove(to);
        state.move_tree(from, to);
        Ok(())
    }

    async fn remove_file(&mut self, path: &str) -> Result<(), SftpFailure> {
        self.server
            .request(Call::RemoveFile(path.to_string()))
            .await?;
        let mut state = self.server.state();
        match state.nodes.get(path).cloned() {
            None => Err(failure(StatusCode::NoSuchFile)),
            Some(Node::Dir) => Err(failure(StatusCode::Failure)),
            Some(_) => {
                state.nodes.remove(path);
                Ok(())
            }
        }
    }

    async fn remove_dir(&mut self, path: &str) -> Result<(), SftpFailure> {
        self.server
            .request(Call::RemoveDir(path.to_string()))
            .await?;
        let mut state = self.server.state();
        match state.nodes.get(path).cloned() {
            None => Err(failure(StatusCode::NoSuchFile)),
            Some(Node::Dir) if !state.children(path).is_empty() => {
                Err(failure(StatusCode::Failure))
            }
            Some(Node::Dir) => {
                state.nodes.remove(path);
                Ok(())
            }
            Some(_) => Err(failure(StatusCode::NotADirectory)),
        }
    }

    async fn make_dir(&mut self, path: &str) -> Result<(), SftpFailure> {
        self.server.request(Call::MakeDir(path.to_string())).await?;
        let mut state = self.server.state();
        if state.nodes.contains_key(path) {
            return Err(failure(StatusCode::Failure));
        }
        if !state.parent_is_dir(path) {
            return Err(failure(StatusCode::NoSuchFile));
        }
        state.nodes.insert(path.to_string(), Node::Dir);
        Ok(())
    }

    async fn stat(&mut self, path: &str) -> Result<RawAttributes, SftpFailure> {
        self.server.request(Call::Stat(path.to_string())).await?;
        let state = self.server.state();
        state
            .nodes
            .get(path)
            .map(ServerState::attrs)
            .ok_or_else(|| failure(StatusCode::NoSuchFile))
    }

    async fn shutdown(&mut self) -> Result<(), SftpFailure> {
        self.server.state().calls.push(Call::Shutdown);
        Ok(())
    }
}

fn dot_entry(name: &str) -> RawEntry {
    RawEntry {
        filename: name.to_string(),
        longname: format!("drwxr-xr-x 2 {USER} staff 4096 Nov 14 22:13 {name}"),
        attrs: ServerState::attrs(&Node::Dir),
    }
}

/// A prompt the provider sent to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    HostKey(String),
    Credentials(AuthMethod),
    Overwrite(String, String),
}

/// Consumer with fixed answers that records every prompt.
pub struct ScriptedConsumer {
    pub trust: bool,
    pub key: Option<PathBuf>,
    pub password: Option<String>,
    pub overwrite: bool,
    /// Offer the password whatever method is asked for
    pub password_for_everything: bool,
    pub prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedConsumer {
    pub fn new() -> Self {
        Self {
            trust: true,
            key: None,
            password: Some(PASSWORD.to_string()),
            overwrite: true,
            password_for_everything: false,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn declining_overwrite() -> Self {
        Self {
            overwrite: false,
            ..Self::new()
        }
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn overwrite_prompts(&self) -> usize {
        self.prompts()
            .iter()
            .filter(|p| matches!(p, Prompt::Overwrite(..)))
            .count()
    }

    fn record(&self, prompt: Prompt) {
        self.prompts.lock().unwrap().push(prompt);
    }
}

#[async_trait]
impl Consumer for ScriptedConsumer {
    async fn confirm_host_key(&self, _host: &str, _port: u16, key: &HostKey) -> bool {
        self.record(Prompt::HostKey(key.fingerprint.clone()));
        self.trust
    }

    async fn provide_credentials(&self, request: &CredentialRequest) -> Option<Credential> {
        self.record(Prompt::Credentials(request.method));
        if self.password_for_everything {
            return self.password.clone().map(Credential::Password);
        }
        match request.method {
            AuthMethod::PublicKey => self.key.clone().map(|path| Credential::PrivateKey {
                path,
                passphrase: None,
            }),
            AuthMethod::Password => self.password.clone().map(Credential::Password),
        }
    }

    async fn confirm_overwrite(&self, from: &RemotePath, to: &RemotePath) -> bool {
        self.record(Prompt::Overwrite(from.to_string(), to.to_string()));
        self.overwrite
    }
}

pub fn path(p: &str) -> RemotePath {
    RemotePath::new(p).unwrap()
}

/// A provider initialized against `server` with `consumer`.
pub async fn provider_with(server: &FakeServer, consumer: Arc<ScriptedConsumer>) -> SftpProvider {
    provider_with_config(server, consumer, ProviderConfig::default()).await
}

pub async fn provider_with_config(
    server: &FakeServer,
    consumer: Arc<ScriptedConsumer>,
    config: ProviderConfig,
) -> SftpProvider {
    let mut provider = SftpProvider::new(server.connector(), config);
    provider
        .initialize(consumer, USER, HOST, PORT)
        .await
        .unwrap();
    provider
}

pub async fn provider(server: &FakeServer) -> SftpProvider {
    provider_with(server, Arc::new(ScriptedConsumer::new())).await
}
