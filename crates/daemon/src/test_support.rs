//! Scripted stand-in for the playout engine's control socket, used by tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct Script {
    responses: HashMap<String, String>,
    prefix_responses: Vec<(String, String)>,
    stalls: HashSet<String>,
    hang_ups: HashSet<String>,
}

#[derive(Default)]
pub struct MockControlServerBuilder {
    greeting: Option<String>,
    script: Script,
}

impl MockControlServerBuilder {
    /// Bytes written to every new connection before any command is read.
    pub fn greeting(mut self, text: &str) -> Self {
        self.greeting = Some(text.to_string());
        self
    }

    /// Reply body for `command`; the sentinel is appended automatically.
    pub fn respond(mut self, command: &str, body: &str) -> Self {
        self.script
            .responses
            .insert(command.to_string(), body.to_string());
        self
    }

    /// Reply body for any command starting with `prefix`.
    pub fn respond_prefix(mut self, prefix: &str, body: &str) -> Self {
        self.script
            .prefix_responses
            .push((prefix.to_string(), body.to_string()));
        self
    }

    /// Never answer `command`.
    pub fn stall(mut self, command: &str) -> Self {
        self.script.stalls.insert(command.to_string());
        self
    }

    /// Close the connection when `command` arrives.
    pub fn hang_up_on(mut self, command: &str) -> Self {
        self.script.hang_ups.insert(command.to_string());
        self
    }

    pub async fn start(mut self) -> MockControlServer {
        self.script
            .responses
            .entry("uptime".to_string())
            .or_insert_with(|| "0d 00h 10m 00s".to_string());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let commands = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(Mutex::new(self.script));
        let greeting = self.greeting;

        let handle = {
            let accepted = accepted.clone();
            let commands = commands.clone();
            let script = script.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        return;
                    };
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let commands = commands.clone();
                    let script = script.clone();
                    let greeting = greeting.clone();
                    tokio::spawn(async move {
                        let (reader, mut writer) = socket.into_split();
                        if let Some(greeting) = greeting {
                            let _ = writer.write_all(greeting.as_bytes()).await;
                        }
                        let mut lines = BufReader::new(reader).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            let command = line.trim().to_string();
                            if command == "quit" {
                                return;
                            }
                            commands.lock().unwrap().push(command.clone());

                            let reply = {
                                let script = script.lock().unwrap();
                                if script.hang_ups.contains(&command) {
                                    return;
                                }
                                if script.stalls.contains(&command) {
                                    None
                                } else {
                                    let by_prefix = script
                                        .prefix_responses
                                        .iter()
                                        .find(|(prefix, _)| command.starts_with(prefix.as_str()))
                                        .map(|(_, body)| body.clone());
                                    Some(
                                        script
                                            .responses
                                            .get(&command)
                                            .cloned()
                                            .or(by_prefix)
                                            .unwrap_or_else(|| {
                                                format!("ERROR: unknown command {}", command)
                                            }),
                                    )
                                }
                            };

                            match reply {
                                Some(body) => {
                                    let mut out = body;
                                    if !out.is_empty() && !out.ends_with('\n') {
                                        out.push('\n');
                                    }
                                    out.push_str("END\n");
                                    if writer.write_all(out.as_bytes()).await.is_err() {
                                        return;
                                    }
                                }
                                None => {
                                    // Hold the connection open without replying.
                                    std::future::pending::<()>().await;
                                }
                            }
                        }
                    });
                }
            })
        };

        MockControlServer {
            address,
            accepted,
            commands,
            script,
            handle,
        }
    }
}

pub struct MockControlServer {
    address: String,
    accepted: Arc<AtomicUsize>,
    commands: Arc<Mutex<Vec<String>>>,
    script: Arc<Mutex<Script>>,
    handle: JoinHandle<()>,
}

impl MockControlServer {
    pub fn builder() -> MockControlServerBuilder {
        MockControlServerBuilder::default()
    }

    pub async fn start() -> Self {
        Self::builder().start().await
    }

    pub fn address(&self) -> String {
        self.address.clone()
    }

    pub fn host(&self) -> String {
        self.address.rsplit_once(':').unwrap().0.to_string()
    }

    pub fn port(&self) -> u16 {
        self.address.rsplit_once(':').unwrap().1.parse().unwrap()
    }

    pub fn connections_accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Every command received so far, excluding health probes.
    pub fn commands_received(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() != "uptime")
            .cloned()
            .collect()
    }

    /// Replace the reply body for `command` while the server runs.
    pub fn set_response(&self, command: &str, body: &str) {
        self.script
            .lock()
            .unwrap()
            .responses
            .insert(command.to_string(), body.to_string());
    }
}

impl Drop for MockControlServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
