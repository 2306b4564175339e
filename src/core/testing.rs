//! In-memory stand-in for the docker CLI used by the orchestration tests.
//!
//! Volumes only carry a byte count; helper containers apply the effect of
//! their script (measure, wipe, extract, copy) to those counts.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::core::error::{VolumeError, VolumeResult};
use crate::core::executor::{CommandResult, CommandRunner, DockerCli};
use crate::utils::constants::{CLONE_TARGET_MOUNT, IMAGE_DATA_DIR, VOLUME_MOUNT};

const UNREACHABLE: &str =
    "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?";

#[derive(Default)]
struct State {
    volumes: BTreeMap<String, u64>,
    images: BTreeMap<String, u64>,
    /// user container -> mounted volumes
    attached: BTreeMap<String, Vec<String>>,
    /// live helper container -> create args
    containers: HashMap<String, Vec<String>>,
    calls: Vec<Vec<String>>,
    scripts: Vec<String>,
    start_failure: Option<CommandResult>,
    start_error: bool,
    import_size: u64,
    start_delay: Duration,
    event_sessions: VecDeque<Vec<String>>,
    stream_sessions: usize,
    daemon_down: bool,
}

#[derive(Default)]
pub struct ScriptedRuntime {
    state: Mutex<State>,
}

fn mounted(create_args: &[String], target: &str) -> Option<String> {
    create_args
        .windows(2)
        .filter(|w| w[0] == "--mount")
        .find_map(|w| {
            let fields: HashMap<&str, &str> = w[1]
                .split(',')
                .filter_map(|kv| kv.split_once('='))
                .collect();
            if fields.get("dst") == Some(&target) {
                fields.get("src").map(|s| s.to_string())
            } else {
                None
            }
        })
}

fn shell_position(create_args: &[String]) -> Option<usize> {
    create_args.iter().position(|a| a == "/bin/sh")
}

fn script_of(create_args: &[String]) -> String {
    shell_position(create_args)
        .and_then(|i| create_args.get(i + 2))
        .cloned()
        .unwrap_or_default()
}

fn image_of(create_args: &[String]) -> Option<String> {
    shell_position(create_args)
        .and_then(|i| i.checked_sub(1))
        .and_then(|i| create_args.get(i))
        .cloned()
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cli(self: &Arc<Self>) -> DockerCli {
        DockerCli::new(self.clone(), "docker")
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn add_volume(&self, name: &str, size: u64) {
        self.with(|s| s.volumes.insert(name.to_string(), size));
    }

    pub fn add_image(&self, image: &str, size: u64) {
        self.with(|s| s.images.insert(image.to_string(), size));
    }

    pub fn attach(&self, container: &str, volume: &str) {
        self.with(|s| {
            s.attached
                .entry(container.to_string())
                .or_default()
                .push(volume.to_string())
        });
    }

    /// Change a volume behind the service's back (another container wrote to it)
    pub fn set_volume_size(&self, name: &str, size: u64) {
        self.add_volume(name, size);
    }

    pub fn volume_size(&self, name: &str) -> Option<u64> {
        self.with(|s| s.volumes.get(name).copied())
    }

    pub fn image_size(&self, image: &str) -> Option<u64> {
        self.with(|s| s.images.get(image).copied())
    }

    pub fn fail_start(&self, result: CommandResult) {
        self.with(|s| s.start_failure = Some(result));
    }

    pub fn error_on_start(&self) {
        self.with(|s| s.start_error = true);
    }

    pub fn set_start_delay(&self, delay: Duration) {
        self.with(|s| s.start_delay = delay);
    }

    pub fn set_import_size(&self, size: u64) {
        self.with(|s| s.import_size = size);
    }

    pub fn set_daemon_down(&self, down: bool) {
        self.with(|s| s.daemon_down = down);
    }

    pub fn push_event_session(&self, lines: &[&str]) {
        self.with(|s| {
            s.event_sessions
                .push_back(lines.iter().map(|l| l.to_string()).collect())
        });
    }

    pub fn stream_sessions(&self) -> usize {
        self.with(|s| s.stream_sessions)
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.with(|s| s.calls.clone())
    }

    /// Number of CLI calls whose first argument is `subcommand`
    pub fn count_calls(&self, subcommand: &str) -> usize {
        self.with(|s| {
            s.calls
                .iter()
                .filter(|c| c.first().map(String::as_str) == Some(subcommand))
                .count()
        })
    }

    /// Number of helper containers started whose script contains `fragment`
    pub fn count_scripts(&self, fragment: &str) -> usize {
        self.with(|s| s.scripts.iter().filter(|sc| sc.contains(fragment)).count())
    }

    pub fn live_containers(&self) -> usize {
        self.with(|s| s.containers.len())
    }

    fn respond(&self, args: &[String]) -> VolumeResult<CommandResult> {
        let a: Vec<&str> = args.iter().map(String::as_str).collect();
        let mut s = self.state.lock().unwrap();

        match a.as_slice() {
            ["volume", "inspect", .., name] => Ok(if s.volumes.contains_key(*name) {
                CommandResult::ok(format!("{}\n", name))
            } else {
                CommandResult::failed(1, format!("Error response from daemon: get {}: no such volume", name))
            }),
            ["volume", "create", name] => {
                s.volumes.entry(name.to_string()).or_insert(0);
                Ok(CommandResult::ok(format!("{}\n", name)))
            }
            ["volume", "rm", name] => {
                if !s.volumes.contains_key(*name) {
                    return Ok(CommandResult::failed(
                        1,
                        format!("Error response from daemon: get {}: no such volume", name),
                    ));
                }
                if s.attached.values().any(|vols| vols.iter().any(|v| v == name)) {
                    return Ok(CommandResult::failed(
                        1,
                        format!("Error response from daemon: remove {}: volume is in use - [abc123]", name),
                    ));
                }
                s.volumes.remove(*name);
                Ok(CommandResult::ok(format!("{}\n", name)))
            }
            ["volume", "ls", ..] => Ok(CommandResult::ok(
                s.volumes
                    .keys()
                    .map(|name| format!("{{\"Driver\":\"local\",\"Labels\":\"\",\"Name\":\"{}\",\"Scope\":\"local\"}}\n", name))
                    .collect::<String>(),
            )),
            ["ps", "--all", "--no-trunc", ..] => Ok(CommandResult::ok(
                s.attached
                    .iter()
                    .map(|(container, vols)| {
                        format!(
                            "{{\"ID\":\"{}id\",\"Mounts\":\"{}\",\"Names\":\"{}\",\"State\":\"running\"}}\n",
                            container,
                            vols.join(","),
                            container
                        )
                    })
                    .collect::<String>(),
            )),
            ["ps", "--all", "--filter", filter, ..] => {
                let volume = filter.trim_start_matches("volume=");
                Ok(CommandResult::ok(
                    s.attached
                        .iter()
                        .filter(|(_, vols)| vols.iter().any(|v| v == volume))
                        .map(|(c, _)| format!("{}\n", c))
                        .collect::<String>(),
                ))
            }
            ["image", "inspect", .., image] => Ok(if s.images.contains_key(*image) {
                CommandResult::ok("sha256:feedface\n")
            } else {
                CommandResult::failed(1, format!("Error: No such image: {}", image))
            }),
            ["create", "--name", name, ..] => {
                s.containers.insert(name.to_string(), args.to_vec());
                Ok(CommandResult::ok("0123456789abcdef\n"))
            }
            ["start", "--attach", name] => {
                if s.start_error {
                    return Err(VolumeError::Spawn {
                        program: "docker".to_string(),
                        source: std::io::Error::new(std::io::ErrorKind::NotFound, "docker vanished"),
                    });
                }
                let create_args = match s.containers.get(*name) {
                    Some(c) => c.clone(),
                    None => return Ok(CommandResult::failed(1, format!("Error: No such container: {}", name))),
                };
                let script = script_of(&create_args);
                s.scripts.push(script.clone());

                if let Some(failure) = s.start_failure.take() {
                    return Ok(failure);
                }
                Ok(Self::apply_script(&mut s, &create_args, &script))
            }
            ["rm", "--force", name] => Ok(if s.containers.remove(*name).is_some() {
                CommandResult::ok(format!("{}\n", name))
            } else {
                CommandResult::failed(1, format!("Error response from daemon: No such container: {}", name))
            }),
            ["run", "--detach", ..] => {
                let container = format!("run{}", s.attached.len());
                let volume = args
                    .windows(2)
                    .find(|w| w[0] == "--mount")
                    .and_then(|w| {
                        w[1].split(',')
                            .find_map(|kv| kv.strip_prefix("src="))
                            .map(str::to_string)
                    });
                s.attached.insert(container.clone(), volume.into_iter().collect());
                Ok(CommandResult::ok(format!("{}id\n", container)))
            }
            ["container", "commit", .., name, image] => {
                let create_args = s.containers.get(*name).cloned().unwrap_or_default();
                let size = mounted(&create_args, VOLUME_MOUNT)
                    .and_then(|v| s.volumes.get(&v).copied())
                    .unwrap_or(0);
                s.images.insert(image.to_string(), size);
                Ok(CommandResult::ok("sha256:c0ffee\n"))
            }
            _ => Ok(CommandResult::ok("")),
        }
    }

    fn apply_script(s: &mut State, create_args: &[String], script: &str) -> CommandResult {
        let volume = mounted(create_args, VOLUME_MOUNT);
        let size_of = |s: &State, v: &Option<String>| {
            v.as_ref().and_then(|v| s.volumes.get(v).copied()).unwrap_or(0)
        };

        if script.contains("stat -c %s") {
            let size = size_of(&*s, &volume);
            return CommandResult::ok(format!("{}\n", size));
        }
        if script.contains("-exec rm -rf") {
            if let Some(v) = volume {
                s.volumes.insert(v, 0);
            }
        } else if script.contains("tar -xzf") {
            if let Some(v) = volume {
                let size = s.import_size;
                s.volumes.insert(v, size);
            }
        } else if script.contains(CLONE_TARGET_MOUNT) {
            let size = size_of(&*s, &volume);
            if let Some(target) = mounted(create_args, CLONE_TARGET_MOUNT) {
                s.volumes.insert(target, size);
            }
        } else if script.starts_with(&format!("cp -Rp {}/.", IMAGE_DATA_DIR)) {
            // load: the image holding the data is the one the container runs
            let size = image_of(create_args)
                .and_then(|image| s.images.get(&image).copied())
                .unwrap_or(0);
            if let Some(v) = volume {
                s.volumes.insert(v, size);
            }
        }
        CommandResult::ok("")
    }
}

#[async_trait]
impl CommandRunner for ScriptedRuntime {
    async fn execute(&self, _program: &str, args: &[String]) -> VolumeResult<CommandResult> {
        let (down, delay) = self.with(|s| {
            s.calls.push(args.to_vec());
            (s.daemon_down, s.start_delay)
        });

        if down {
            return Ok(CommandResult::failed(1, UNREACHABLE));
        }
        if args.first().map(String::as_str) == Some("start") && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.respond(args)
    }

    async fn execute_streaming(
        &self,
        _program: &str,
        args: &[String],
        lines: mpsc::Sender<String>,
    ) -> VolumeResult<Option<i32>> {
        let session = self.with(|s| {
            s.calls.push(args.to_vec());
            s.stream_sessions += 1;
            s.event_sessions.pop_front()
        });

        match session {
            Some(session) => {
                for line in session {
                    if lines.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(Some(0))
            }
            None => {
                futures::future::pending::<()>().await;
                Ok(None)
            }
        }
    }
}
