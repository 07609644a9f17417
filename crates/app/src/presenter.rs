use shinku_core::PresentationEvent;
use shinku_llm::{Message, SessionId};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

const SOURCE_MARKER: &str = ">";

/// Renders presentation events as plain terminal text.
///
/// Output of a turn that is no longer the latest one is dropped, so a
/// superseded turn can never interleave with its replacement.
#[derive(Debug, Default)]
pub struct TerminalPresenter {
    active: Option<SessionId>,
    mid_line: bool,
    received_output: bool,
}

impl TerminalPresenter {
    pub fn render(&mut self, event: &PresentationEvent) -> String {
        match event {
            PresentationEvent::TurnStarted {
                session_id,
                content,
            } => {
                let prefix = self.end_line();
                self.active = Some(*session_id);
                self.received_output = false;
                format!("{prefix}\n{SOURCE_MARKER} {}\n", content.trim())
            }
            PresentationEvent::Partial { session_id, text } => {
                if self.active != Some(*session_id) || text.is_empty() {
                    return String::new();
                }
                self.received_output = true;
                self.mid_line = !text.ends_with('\n');
                text.clone()
            }
            PresentationEvent::Completed { session_id, .. } => {
                if self.active != Some(*session_id) {
                    return String::new();
                }
                self.active = None;
                if self.received_output {
                    self.end_line()
                } else {
                    "(empty response)\n".to_string()
                }
            }
            PresentationEvent::Error {
                session_id,
                description,
            } => {
                if self.active != Some(*session_id) {
                    return String::new();
                }
                self.active = None;
                format!("{}[error] {description}\n", self.end_line())
            }
            PresentationEvent::HistoryCleared => {
                self.active = None;
                format!("{}[history cleared]\n", self.end_line())
            }
        }
    }

    fn end_line(&mut self) -> String {
        if std::mem::take(&mut self.mid_line) {
            "\n".to_string()
        } else {
            String::new()
        }
    }

    /// Lists the conversation, starting on a fresh line if a turn is mid-output.
    pub fn render_history(&mut self, messages: &[Message]) -> String {
        let prefix = self.end_line();
        if messages.is_empty() {
            return format!("{prefix}(history is empty)\n");
        }

        messages.iter().fold(prefix, |mut rendered, message| {
            rendered.push_str(&format!(
                "[{}] {}\n",
                message.role().as_str(),
                message.content()
            ));
            rendered
        })
    }
}

/// Sole writer of stdout: renders coordinator events and requested history
/// dumps until the coordinator drops its sender.
pub async fn run(
    mut events: mpsc::UnboundedReceiver<PresentationEvent>,
    mut histories: mpsc::UnboundedReceiver<Vec<Message>>,
) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut presenter = TerminalPresenter::default();

    loop {
        let text = tokio::select! {
            event = events.recv() => match event {
                Some(event) => presenter.render(&event),
                None => break,
            },
            Some(history) = histories.recv() => presenter.render_history(&history),
        };
        if text.is_empty() {
            continue;
        }
        stdout.write_all(text.as_bytes()).await?;
        stdout.flush().await?;
    }

    Ok(())
}
