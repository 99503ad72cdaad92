//! Deterministic doubles for the runner and filesystem ports.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use crate::{
    error::{CommandFailure, Error, Result},
    tooling::FsPort,
    utils::process::{CmdSpec, Runner},
};

/// Commands that only read state; everything else counts as a mutation.
const PROBES: &[&str] = &["pvs ", "losetup -a", "findmnt ", "blkid "];

#[derive(Clone)]
enum Outcome {
    Out(String),
    Fail,
    Timeout,
}

struct Rule {
    prefix: String,
    outcomes: VecDeque<Outcome>,
}

type Hook = Box<dyn Fn(&str, bool) + Send + Sync>;

/// Records every rendered command and answers from prefix rules. A rule
/// with several outcomes yields them in order and then repeats the last one.
/// Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<(String, Option<Duration>)>>,
    rules: Mutex<Vec<Rule>>,
    hook: Option<Hook>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(self, prefix: &str, outcomes: Vec<Outcome>) -> Self {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.to_string(),
            outcomes: outcomes.into(),
        });
        self
    }

    pub fn on<I, S>(self, prefix: &str, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let outcomes = outputs.into_iter().map(|s| Outcome::Out(s.into())).collect();
        self.rule(prefix, outcomes)
    }

    pub fn fail_on(self, prefix: &str) -> Self {
        self.rule(prefix, vec![Outcome::Fail])
    }

    pub fn timeout_on(self, prefix: &str) -> Self {
        self.rule(prefix, vec![Outcome::Timeout])
    }

    /// Called with the rendered command and whether it succeeded, before
    /// the outcome is returned to the caller.
    pub fn with_hook(mut self, f: impl Fn(&str, bool) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(f));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !PROBES.iter().any(|p| c.starts_with(p)))
            .collect()
    }

    pub fn timeout_of(&self, prefix: &str) -> Option<Duration> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|(c, _)| c.starts_with(prefix))
            .and_then(|(_, t)| *t)
    }

    fn answer(&self, cmd: &CmdSpec) -> Result<String> {
        let rendered = cmd.render();
        self.calls
            .lock()
            .unwrap()
            .push((rendered.clone(), cmd.timeout_override()));
        let outcome = {
            let mut rules = self.rules.lock().unwrap();
            rules
                .iter_mut()
                .find(|r| rendered.starts_with(&r.prefix))
                .and_then(|r| {
                    if r.outcomes.len() > 1 {
                        r.outcomes.pop_front()
                    } else {
                        r.outcomes.front().cloned()
                    }
                })
        };
        if let Some(hook) = &self.hook {
            hook(&rendered, matches!(outcome, None | Some(Outcome::Out(_))));
        }

        match outcome {
            None => Ok(String::new()),
            Some(Outcome::Out(s)) => Ok(s),
            Some(Outcome::Fail) => Err(Error::Command {
                cmd: rendered,
                failure: CommandFailure::Exit("exit status: 5".into()),
            }),
            Some(Outcome::Timeout) => Err(Error::Command {
                cmd: rendered,
                failure: CommandFailure::Timeout(Duration::from_secs(60)),
            }),
        }
    }
}

impl Runner for FakeRunner {
    fn run(&self, cmd: &CmdSpec) -> Result<()> {
        self.answer(cmd).map(|_| ())
    }

    fn run_capture(&self, cmd: &CmdSpec) -> Result<String> {
        self.answer(cmd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Dir,
    File,
    Block,
    Fifo,
}

#[derive(Default)]
struct FsState {
    nodes: BTreeMap<PathBuf, Node>,
    mounts: BTreeSet<PathBuf>,
    available: BTreeMap<PathBuf, u64>,
    ops: Vec<String>,
}

/// In-memory host filesystem. `/` is always a mount boundary.
#[derive(Default)]
pub struct FakeFs {
    state: Mutex<FsState>,
}

impl FakeFs {
    pub fn new() -> Self {
        let fs = Self::default();
        fs.add(Path::new("/"), Node::Dir);
        fs
    }

    pub fn add(&self, path: impl AsRef<Path>, node: Node) -> &Self {
        self.state
            .lock()
            .unwrap()
            .nodes
            .insert(path.as_ref().to_path_buf(), node);
        self
    }

    pub fn add_mount(&self, path: impl AsRef<Path>) -> &Self {
        let path = path.as_ref();
        self.add(path, Node::Dir);
        self.state.lock().unwrap().mounts.insert(path.to_path_buf());
        self
    }

    pub fn set_available_mb(&self, dir: impl AsRef<Path>, mb: u64) -> &Self {
        self.state
            .lock()
            .unwrap()
            .available
            .insert(dir.as_ref().to_path_buf(), mb * 1024 * 1024);
        self
    }

    pub fn node(&self, path: impl AsRef<Path>) -> Option<Node> {
        self.state.lock().unwrap().nodes.get(path.as_ref()).copied()
    }

    /// Mutations performed through the port, e.g. `mkdir /mnt/snap`.
    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    fn take(&self, path: &Path, want: Node, op: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.nodes.get(path) != Some(&want) {
            return Err(Error::Io {
                context: format!("{op} {}", path.display()),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        st.nodes.remove(path);
        st.ops.push(format!("{op} {}", path.display()));
        Ok(())
    }
}

impl FsPort for FakeFs {
    fn exists(&self, path: &Path) -> bool {
        self.node(path).is_some()
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.node(path) == Some(Node::Dir)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.node(path) == Some(Node::File)
    }

    fn is_block_device(&self, path: &Path) -> bool {
        self.node(path) == Some(Node::Block)
    }

    fn is_mount(&self, path: &Path) -> bool {
        path == Path::new("/") || self.state.lock().unwrap().mounts.contains(path)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }

    fn available_bytes(&self, dir: &Path) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .available
            .get(dir)
            .copied()
            .unwrap_or(u64::MAX / 2))
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.nodes.insert(path.to_path_buf(), Node::Dir);
        st.ops.push(format!("mkdir {}", path.display()));
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        self.take(path, Node::Dir, "rmdir")
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.take(path, Node::File, "rm")
    }
}
