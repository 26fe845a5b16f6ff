use serde::Serialize;

/// How results reach the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    /// Pretty JSON or plain text for people.
    Human,
    /// One JSON object per line for agents and scripts.
    Json,
}

/// Line-oriented JSON written by `--json` runs. Results carry `status`, stream
/// lines carry `event`.
#[derive(Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum Envelope<'a, T> {
    Ok { command: &'a str, data: T },
    Error { error: &'a str },
}

#[derive(Serialize)]
struct StreamLine<'a, T> {
    event: &'a str,
    #[serde(flatten)]
    data: T,
}

#[derive(Serialize)]
struct Message<'a> {
    message: &'a str,
}

pub struct Output {
    format: Format,
}

impl Output {
    pub fn new(json: bool) -> Self {
        let format = if json { Format::Json } else { Format::Human };
        Self { format }
    }

    /// Prints a command result.
    pub fn success<T: Serialize>(&self, command: &str, data: T) {
        println!("{}", self.render_result(command, data));
    }

    /// Prints a result that is only a sentence.
    pub fn success_message(&self, command: &str, message: &str) {
        match self.format {
            Format::Human => println!("{message}"),
            Format::Json => println!("{}", self.render_result(command, Message { message })),
        }
    }

    pub fn error(&self, message: &str) {
        eprintln!("{}", self.render_error(message));
    }

    /// Prints one line of a stream (`listen`).
    pub fn event<T: Serialize>(&self, event: &str, data: T) {
        println!("{}", self.render_event(event, data));
    }

    fn render_result<T: Serialize>(&self, command: &str, data: T) -> String {
        match self.format {
            Format::Human => pretty(&data),
            Format::Json => compact(&Envelope::Ok { command, data }),
        }
    }

    fn render_error(&self, error: &str) -> String {
        match self.format {
            Format::Human => format!("Error: {error}"),
            Format::Json => compact::<Envelope<'_, ()>>(&Envelope::Error { error }),
        }
    }

    fn render_event<T: Serialize>(&self, event: &str, data: T) -> String {
        match self.format {
            Format::Human => format!("[{event}] {}", pretty(&data)),
            Format::Json => compact(&StreamLine { event, data }),
        }
    }
}

fn compact<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn pretty<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}
