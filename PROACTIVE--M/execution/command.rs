use std::path::Path;

/// Maps a file path onto the command inspecting it.
///
/// Text and markdown files are printed; everything else is listed.
#[must_use]
pub fn derive_command(file_path: &str) -> (String, Vec<String>) {
    let is_text = Path::new(file_path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext.to_lowercase().as_str(), "txt" | "md"));

    let (program, mut args) = match (is_text, cfg!(windows)) {
        (true, false) => ("cat", Vec::new()),
        (true, true) => ("type", Vec::new()),
        (false, false) => ("ls", vec!["-l".to_string()]),
        (false, true) => ("dir", Vec::new()),
    };
    args.push(file_path.to_string());
    (program.to_string(), args)
}

/// Exact-match allow-list of program names. An empty list permits nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandPolicy {
    allowed: Vec<String>,
}

impl CommandPolicy {
    /// Builds the policy, ignoring blank entries.
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed
                .into_iter()
                .map(Into::into)
                .map(|entry: String| entry.trim().to_string())
                .filter(|entry| !entry.is_empty())
                .collect(),
        }
    }

    /// Whether `program` may run.
    #[must_use]
    pub fn permits(&self, program: &str) -> bool {
        self.allowed.iter().any(|entry| entry == program)
    }

    /// Allowed program names.
    #[must_use]
    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }
}
