//! Line-oriented command surface on stdin/stdout for a single local user.

use anyhow::Result;
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::state::unique_filename;
use crate::core::voices::VoiceRegistry;
use crate::services::controller::SessionManager;
use crate::services::events::{EventSink, Prompt, SessionEvent};

pub const CONSOLE_USER: &str = "console";

const HISTORY_LIMIT: usize = 500;
const DEFAULT_SEARCH_LIMIT: usize = 50;
const MAX_CANDIDATES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Extract(String),
    Stop,
    Skip,
    Voices,
    AddVoice { name: String, id: String },
    RemoveVoice(String),
    SearchVoice(usize),
    Help,
    Quit,
    /// Anything that is not a command, e.g. an answer to a prompt.
    Reply(String),
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('!') else {
        return Ok(Command::Reply(line.to_string()));
    };

    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default().to_ascii_lowercase();
    let args: Vec<&str> = parts.collect();

    match (name.as_str(), args.as_slice()) {
        ("extract", [url]) => Ok(Command::Extract(url.to_string())),
        ("extract", _) => Err("Usage: !extract <url>".to_string()),
        ("stop", []) => Ok(Command::Stop),
        ("skip", []) => Ok(Command::Skip),
        ("voices", []) => Ok(Command::Voices),
        ("addvoice", [name, id]) => Ok(Command::AddVoice {
            name: name.to_string(),
            id: id.to_string(),
        }),
        ("addvoice", _) => Err("Usage: !addvoice <VoiceName> <voice_id>".to_string()),
        ("removevoice", [key]) => Ok(Command::RemoveVoice(key.to_string())),
        ("removevoice", _) => Err("Usage: !removevoice <number>".to_string()),
        ("searchvoice", []) => Ok(Command::SearchVoice(DEFAULT_SEARCH_LIMIT)),
        ("searchvoice", [limit]) => limit
            .parse()
            .map(Command::SearchVoice)
            .map_err(|_| "Usage: !searchvoice [limit]".to_string()),
        ("help", _) => Ok(Command::Help),
        ("quit" | "exit", _) => Ok(Command::Quit),
        _ => Err(format!("Unknown command: !{}. Type !help for a list.", name)),
    }
}

const HELP: &str = "\
Commands:
  !extract <url>              Extract scripts from a document and generate audio
  !stop                       Stop all generation
  !skip                       Skip the rest of the current script
  !voices                     List available voices
  !addvoice <name> <voice_id> Add a custom voice
  !removevoice <number>       Remove a custom voice
  !searchvoice [limit]        Look for voice ids in recent messages
  !quit                       Exit";

fn render_voices(registry: &VoiceRegistry) -> String {
    let mut out = String::from("Available Voices:\n");
    for (key, voice) in registry.entries() {
        out.push_str(&format!("  {}. {}\n", key, voice.name));
    }
    out.push_str("Use `!addvoice Name voice_id` to add more voices");
    out
}

pub fn render_prompt(prompt: &Prompt) -> String {
    match prompt {
        Prompt::ChooseScripts { available } => {
            let list = available
                .iter()
                .map(|k| format!("Script #{}", k))
                .collect::<Vec<_>>()
                .join("\n  ");
            format!(
                "Available Scripts:\n  {}\nEnter script numbers (e.g., `1,3` or `all`):",
                list
            )
        }
        Prompt::ChooseVoices { script, voices } => {
            let list = voices
                .iter()
                .map(|(key, name)| format!("{}. {}", key, name))
                .collect::<Vec<_>>()
                .join("\n  ");
            format!(
                "Voices for Script #{}:\n  {}\nEnter voice numbers or custom voice IDs (comma separated):",
                script, list
            )
        }
    }
}

/// Prints session events and saves delivered audio to the output folder.
pub struct ConsoleSink {
    output_folder: PathBuf,
    progress: Mutex<Option<ProgressBar>>,
}

impl ConsoleSink {
    pub fn new(output_folder: impl AsRef<Path>) -> Self {
        Self {
            output_folder: output_folder.as_ref().to_path_buf(),
            progress: Mutex::new(None),
        }
    }

    fn start_progress(&self, total: usize) {
        let pb = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        if let Some(old) = self.progress_slot().replace(pb) {
            old.finish_and_clear();
        }
    }

    fn finish_progress(&self) {
        if let Some(pb) = self.progress_slot().take() {
            pb.finish_and_clear();
        }
    }

    fn progress_slot(&self) -> std::sync::MutexGuard<'_, Option<ProgressBar>> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes to a fresh file, numbering the name when it already exists.
    async fn save(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.output_folder).await?;
        let mut taken = Vec::new();
        loop {
            let name = unique_filename(filename, &taken);
            let path = self.output_folder.join(&name);
            let opened = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            match opened {
                Ok(mut file) => {
                    file.write_all(bytes).await?;
                    file.flush().await?;
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => taken.push(name),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl EventSink for ConsoleSink {
    async fn emit(&self, event: SessionEvent) {
        match event {
            SessionEvent::Notice(text) => println!("{}", text),
            SessionEvent::Prompt(prompt) => println!("{}", render_prompt(&prompt)),
            SessionEvent::ScriptsSelected(keys) => println!(
                "Selected scripts: {}",
                keys.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(", ")
            ),
            SessionEvent::VoicesSelected { script, voices } => {
                println!("Script #{}: {}", script, voices.join(", "))
            }
            SessionEvent::PlanReady { scripts, pairs } => {
                println!("Generating {} audio files across {} scripts...", pairs, scripts);
                println!("Use `!stop` to stop all, or `!skip` to skip the current script.");
            }
            SessionEvent::PairStarted {
                script,
                voice,
                paragraphs,
            } => {
                println!(
                    "Generating Script #{} with {} ({} paragraphs)...",
                    script, voice, paragraphs
                );
                self.start_progress(paragraphs);
            }
            SessionEvent::ParagraphSynthesized { done, .. } => {
                if let Some(pb) = self.progress_slot().as_ref() {
                    pb.set_position(done as u64);
                }
            }
            SessionEvent::PairCompleted {
                script,
                voice,
                artifact,
            } => {
                self.finish_progress();
                match self.save(&artifact.filename, &artifact.bytes).await {
                    Ok(path) => println!("Script #{} - {}: saved {}", script, voice, path.display()),
                    Err(e) => {
                        log::error!("Failed to save {}: {:#}", artifact.filename, e);
                        println!("Script #{} - {}: could not save audio", script, voice);
                    }
                }
            }
            SessionEvent::PairSkipped { script, voice } => {
                self.finish_progress();
                println!("Skipped Script #{} with {}", script, voice);
            }
            SessionEvent::ScriptSkipped(script) => {
                println!("Skipped remaining voices for Script #{}", script)
            }
            SessionEvent::PairStopped { script, voice } => {
                self.finish_progress();
                println!("Stopped during Script #{} with {}", script, voice);
            }
            SessionEvent::PairFailed {
                script,
                voice,
                error,
            } => {
                self.finish_progress();
                println!("Error generating Script #{} with {}: {}", script, voice, error);
            }
            SessionEvent::Finished(outcome) => {
                self.finish_progress();
                println!(
                    "Session finished ({:?}): {} delivered, {} skipped, {} failed",
                    outcome.state,
                    outcome.delivered.len(),
                    outcome.skipped.len(),
                    outcome.failed.len()
                );
            }
        }
    }
}

struct Console {
    manager: Arc<SessionManager>,
    output_folder: PathBuf,
    history: VecDeque<String>,
    pending: Option<mpsc::Sender<String>>,
    task: Option<JoinHandle<()>>,
}

impl Console {
    fn new(manager: Arc<SessionManager>, output_folder: impl AsRef<Path>) -> Self {
        Self {
            manager,
            output_folder: output_folder.as_ref().to_path_buf(),
            history: VecDeque::new(),
            pending: None,
            task: None,
        }
    }

    /// A spawned extract that has not finished yet, whether or not its
    /// session is registered already.
    fn busy(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
            || self.manager.sessions().get(CONSOLE_USER).is_some()
    }

    fn remember(&mut self, line: String) {
        self.history.push_back(line);
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }

    fn extract(&mut self, url: String) {
        if self.busy() {
            println!("A generation session is already running. Use !stop first.");
            return;
        }

        let (tx, rx) = mpsc::channel(8);
        self.pending = Some(tx);
        let manager = self.manager.clone();
        let sink = ConsoleSink::new(&self.output_folder);
        self.task = Some(tokio::spawn(async move {
            if let Err(e) = manager.extract(CONSOLE_USER, &url, rx, &sink).await {
                println!("Error: {}", e);
            }
        }));
    }

    async fn reply(&mut self, text: String) {
        match &self.pending {
            Some(tx) if !tx.is_closed() => {
                if tx.send(text).await.is_err() {
                    println!("No question is waiting for an answer.");
                }
            }
            _ => println!("Unknown input. Type !help for a list of commands."),
        }
    }

    fn search(&self, limit: usize) {
        println!("Searching last {} messages for voice IDs...", limit);
        let recent: Vec<String> = self.history.iter().rev().take(limit).cloned().collect();
        let found = self.manager.search_voices(&recent, MAX_CANDIDATES);
        if found.is_empty() {
            println!("No potential voice IDs found in recent messages.");
            return;
        }
        println!("Found potential voice IDs:");
        for (i, candidate) in found.iter().enumerate() {
            println!("{}. {}\n   Context: {}", i + 1, candidate.id, candidate.context);
        }
        println!("Use `!addvoice YourName voice_id` to add a voice");
    }

    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Extract(url) => self.extract(url),
            Command::Stop => match self.manager.signal_stop(CONSOLE_USER) {
                Ok(()) => println!("Stopping all generation... Current tasks will finish, then stop."),
                Err(e) => println!("{}", e),
            },
            Command::Skip => match self.manager.signal_skip(CONSOLE_USER) {
                Ok(Some(script)) => println!("Skipping Script #{}... Moving to next script.", script),
                Ok(None) => println!("Skip requested."),
                Err(e) => println!("{}", e),
            },
            Command::Voices => println!("{}", render_voices(&self.manager.voices())),
            Command::AddVoice { name, id } => {
                let added = self.manager.add_voice(&name, &id).await;
                let (key, profile) = &added.value;
                println!("Added voice {} (#{}) with ID: {}", profile.name, key, profile.backend_id);
                if let Some(e) = added.write_error {
                    println!("Warning: {}", e);
                }
            }
            Command::RemoveVoice(key) => match self.manager.remove_voice(&key).await {
                Ok(removed) => {
                    println!("Removed voice {} (#{})", removed.value.name, key);
                    if let Some(e) = removed.write_error {
                        println!("Warning: {}", e);
                    }
                }
                Err(e) => println!("{}", e),
            },
            Command::SearchVoice(limit) => self.search(limit),
            Command::Help => println!("{}", HELP),
            Command::Quit => return false,
            Command::Reply(text) => self.reply(text).await,
        }
        true
    }

    async fn shutdown(&mut self) {
        self.pending = None;
        if self.manager.signal_stop(CONSOLE_USER).is_ok() {
            println!("Waiting for running tasks to finish...");
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Generation task failed: {}", e);
            }
        }
    }
}

pub async fn run(manager: Arc<SessionManager>, output_folder: impl AsRef<Path>) -> Result<()> {
    let mut console = Console::new(manager, output_folder);
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let keep_going = match parse_command(&line) {
            Ok(command) => console.handle(command).await,
            Err(usage) => {
                println!("{}", usage);
                true
            }
        };
        console.remember(line);
        if !keep_going {
            break;
        }
    }

    console.shutdown().await;
    Ok(())
}
