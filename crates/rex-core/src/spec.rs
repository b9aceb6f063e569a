//! The pipeline specification: the immutable input to a run.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifying metadata shared by specs, steps, and volumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// The target platform a pipeline is built for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub variant: String,
    #[serde(default)]
    pub version: String,
}

/// The full, immutable pipeline specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Spec {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub secrets: Vec<Secret>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub files: Vec<File>,
    #[serde(default)]
    pub docker: Option<DockerConfig>,
}

impl Spec {
    /// Look up a step by name.
    pub fn find_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.metadata.name == name)
    }

    /// Look up a secret by name. Unresolved references return `None`
    /// rather than an error; callers silently skip what they can't find.
    pub fn find_secret(&self, name: &str) -> Option<&Secret> {
        self.secrets.iter().find(|s| s.name == name)
    }

    /// Look up a file by name.
    pub fn find_file(&self, name: &str) -> Option<&File> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Look up a declared volume by name.
    pub fn find_volume(&self, name: &str) -> Option<&Volume> {
        self.docker
            .as_ref()
            .into_iter()
            .flat_map(|d| d.volumes.iter())
            .find(|v| v.metadata.name == name)
    }

    /// Look up registry auth for a hostname, normalizing the legacy
    /// `index.docker.io` alias and stripping an `http(s)://` scheme.
    pub fn find_auth(&self, domain: &str) -> Option<&DockerAuth> {
        let docker = self.docker.as_ref()?;
        docker.auths.iter().find(|auth| {
            let mut host = auth.address.as_str();
            if let Some(rest) = host
                .strip_prefix("http://")
                .or_else(|| host.strip_prefix("https://"))
            {
                host = match rest.split_once('/') {
                    Some((h, _)) => h,
                    None => rest,
                };
            }
            let host = if host == "index.docker.io" {
                "docker.io"
            } else {
                host
            };
            host == domain
        })
    }
}

/// A reference to a secret from a step, with the env var it's injected as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretVar {
    pub name: String,
    /// Environment variable name the secret is exposed as. Defaults to
    /// the secret's own name when empty.
    #[serde(default)]
    pub env: String,
}

/// A pipeline step: one containerized unit of work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub metadata: Metadata,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub pull_policy: PullPolicy,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub networks: Vec<String>,

    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub detach: bool,
    #[serde(default)]
    pub run_policy: RunPolicy,
    #[serde(default)]
    pub ignore_err: bool,
    #[serde(default)]
    pub ignore_stdout: bool,
    #[serde(default)]
    pub ignore_stderr: bool,

    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<SecretVar>,
    #[serde(default)]
    pub files: Vec<FileMount>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub devices: Vec<VolumeDevice>,
    #[serde(default)]
    pub resources: Option<Resources>,

    #[serde(default)]
    pub restore: Vec<RestoreEntry>,
    #[serde(default)]
    pub backup: Vec<BackupEntry>,
    #[serde(default)]
    pub export: Vec<ExportEntry>,
}

/// A pre-start upload: bytes from `source` land at `target` in the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreEntry {
    /// Either a host filesystem path or an RFC 2397 `data:` URL.
    pub source: String,
    pub target: String,
}

/// A post-wait download: `source` in the container is written to the host FS at `target`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEntry {
    pub source: String,
    pub target: String,
}

/// A post-wait download delivered to the `got_file` hook instead of the host FS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportEntry {
    pub path: String,
    #[serde(default)]
    pub mime: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub port: u16,
    pub host: u16,
    #[serde(default)]
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resources {
    pub limits: Option<ResourceObject>,
    pub requests: Option<ResourceObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceObject {
    pub cpu: i64,
    pub memory: i64,
}

/// A named secret value. `mask` controls whether its value is
/// redacted from step logs wherever it appears verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    pub data: String,
    #[serde(default)]
    pub mask: bool,
}

/// An inline file blob, keyed by name, mounted into steps via `FileMount`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMount {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub mode: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerAuth {
    pub address: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: Vec<DockerAuth>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub empty_dir: Option<VolumeEmptyDir>,
    #[serde(default)]
    pub host_path: Option<VolumeHostPath>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeEmptyDir {
    #[serde(default)]
    pub medium: String,
    #[serde(default)]
    pub size_limit: i64,
}

impl VolumeEmptyDir {
    /// A `medium` of `"memory"` backs the volume with tmpfs.
    pub fn is_memory_backed(&self) -> bool {
        self.medium.eq_ignore_ascii_case("memory")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeHostPath {
    pub path: String,
    #[serde(default)]
    pub kind: HostPathType,
}

impl VolumeHostPath {
    /// `\\.\pipe\` prefixed paths denote a Windows named pipe rather
    /// than an ordinary bind mount.
    pub fn is_named_pipe(&self) -> bool {
        self.path.starts_with(r"\\.\pipe\")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeDevice {
    pub name: String,
    pub path: String,
}

/// Container image pull policy. The empty string decodes as `Default`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PullPolicy {
    #[default]
    Default,
    Always,
    IfNotExists,
    Never,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullPolicy::Default => "default",
            PullPolicy::Always => "always",
            PullPolicy::IfNotExists => "if-not-exists",
            PullPolicy::Never => "never",
        }
    }

    fn from_str_lenient(s: &str) -> Self {
        match s {
            "" | "default" => PullPolicy::Default,
            "always" => PullPolicy::Always,
            "if-not-exists" => PullPolicy::IfNotExists,
            "never" => PullPolicy::Never,
            _ => PullPolicy::Default,
        }
    }
}

/// The point-in-time run policy for a step, evaluated against the
/// pipeline's running failure state when the step becomes eligible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunPolicy {
    #[default]
    OnSuccess,
    OnFailure,
    Always,
    Never,
}

impl RunPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPolicy::OnSuccess => "on-success",
            RunPolicy::OnFailure => "on-failure",
            RunPolicy::Always => "always",
            RunPolicy::Never => "never",
        }
    }

    fn from_str_lenient(s: &str) -> Self {
        match s {
            "" | "on-success" => RunPolicy::OnSuccess,
            "on-failure" => RunPolicy::OnFailure,
            "always" => RunPolicy::Always,
            "never" => RunPolicy::Never,
            _ => RunPolicy::OnSuccess,
        }
    }

    /// Whether a step with this policy should run given the current
    /// pipeline failure state.
    pub fn should_run(&self, pipeline_failed: bool) -> bool {
        match self {
            RunPolicy::Never => false,
            RunPolicy::Always => true,
            RunPolicy::OnSuccess => !pipeline_failed,
            RunPolicy::OnFailure => pipeline_failed,
        }
    }
}

/// The kind of host path mounted by a `VolumeHostPath`. Unlike
/// `PullPolicy`/`RunPolicy`, there is no empty-string default: a
/// missing value is a configuration error, not a documented default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPathType {
    DirOrCreate,
    Directory,
    FileOrCreate,
    File,
    Socket,
    CharDev,
    BlockDev,
}

impl Default for HostPathType {
    fn default() -> Self {
        HostPathType::DirOrCreate
    }
}

impl HostPathType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostPathType::DirOrCreate => "dir-or-create",
            HostPathType::Directory => "path-dir",
            HostPathType::FileOrCreate => "file-or-create",
            HostPathType::File => "file",
            HostPathType::Socket => "socket",
            HostPathType::CharDev => "char-dev",
            HostPathType::BlockDev => "block-dev",
        }
    }
}

macro_rules! string_enum_codec {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Ok(<$ty>::from_str_lenient(&s))
            }
        }
    };
}

string_enum_codec!(PullPolicy);
string_enum_codec!(RunPolicy);

impl Serialize for HostPathType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for HostPathType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "dir-or-create" => Ok(HostPathType::DirOrCreate),
            "path-dir" => Ok(HostPathType::Directory),
            "file-or-create" => Ok(HostPathType::FileOrCreate),
            "file" => Ok(HostPathType::File),
            "socket" => Ok(HostPathType::Socket),
            "char-dev" => Ok(HostPathType::CharDev),
            "block-dev" => Ok(HostPathType::BlockDev),
            other => Err(D::Error::custom(format!("invalid host path type: {other}"))),
        }
    }
}

mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD
            .encode(bytes)
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        use base64::Engine as _;
        use serde::de::Error as _;
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(D::Error::custom)
    }
}

/// The terminal state of a step's container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub exit_code: i32,
    pub exited: bool,
    pub oom_killed: bool,
}
