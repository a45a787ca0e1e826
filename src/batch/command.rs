use std::ffi::OsString;
use std::path::Path;

/// One argv entry of a job command. Path slots are filled per job and always
/// stay a single argument, whatever characters the file name contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateArg {
    Literal(String),
    Input { prefix: String },
    Output { prefix: String },
}

impl TemplateArg {
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    pub fn input() -> Self {
        Self::Input {
            prefix: String::new(),
        }
    }

    pub fn output() -> Self {
        Self::Output {
            prefix: String::new(),
        }
    }

    pub fn output_with_prefix(prefix: impl Into<String>) -> Self {
        Self::Output {
            prefix: prefix.into(),
        }
    }

    fn render(&self, input: &Path, output: &Path) -> OsString {
        let (prefix, path) = match self {
            Self::Literal(value) => return OsString::from(value),
            Self::Input { prefix } => (prefix, input),
            Self::Output { prefix } => (prefix, output),
        };
        // Paths are spliced as raw OS strings; non-UTF-8 names reach the tool intact.
        let mut arg = OsString::from(prefix);
        arg.push(path.as_os_str());
        arg
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandTemplate {
    args: Vec<TemplateArg>,
}

impl CommandTemplate {
    pub fn new(args: Vec<TemplateArg>) -> Self {
        Self { args }
    }

    pub fn push(mut self, arg: TemplateArg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn args(&self) -> &[TemplateArg] {
        self.args.as_slice()
    }

    pub fn writes_output(&self) -> bool {
        self.args
            .iter()
            .any(|arg| matches!(arg, TemplateArg::Output { .. }))
    }

    pub fn render(&self, input: &Path, output: &Path) -> Vec<OsString> {
        self.args
            .iter()
            .map(|arg| arg.render(input, output))
            .collect()
    }
}
