use std::fmt;

pub type JinjateResult<T> = std::result::Result<T, Error>;

/// The category of an [`Error`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed source, raised by the lexer or the parser.
    TemplateSyntax,
    /// A well formed template that breaks a compile time rule.
    TemplateAssertion,
    /// A loader could not find the requested template.
    TemplateNotFound,
    /// None of several candidate templates could be found.
    TemplatesNotFound,
    /// An undefined value was used in a way that requires a real value.
    Undefined,
    /// Any other failure while executing a compiled template.
    TemplateRuntime,
    /// A value had the wrong type for an operation, or a call had bad arguments.
    Type,
    /// The sandbox policy denied an operation.
    Security,
}

impl ErrorKind {
    /// Assertion errors are a subtype of syntax errors.
    pub const fn is_syntax_error(self) -> bool {
        matches!(self, Self::TemplateSyntax | Self::TemplateAssertion)
    }

    pub const fn is_not_found(self) -> bool {
        matches!(self, Self::TemplateNotFound | Self::TemplatesNotFound)
    }

    const fn label(self) -> &'static str {
        match self {
            Self::TemplateSyntax => "syntax error",
            Self::TemplateAssertion => "assertion error",
            Self::TemplateNotFound => "template not found",
            Self::TemplatesNotFound => "templates not found",
            Self::Undefined => "undefined error",
            Self::TemplateRuntime => "runtime error",
            Self::Type => "type error",
            Self::Security => "security error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One frame of template code that was executing when a runtime error was raised.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceFrame {
    pub name: Option<String>,
    pub filename: Option<String>,
    pub lineno: usize,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let location = self
            .filename
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or("<template>");
        write!(f, "File \"{}\", line {}", location, self.lineno)
    }
}

/// The error type for everything that can go wrong while loading, compiling or rendering.
///
/// The payload is boxed so results stay pointer sized on the interpreter's hot paths.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Error {
    repr: Box<ErrorRepr>,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ErrorRepr {
    kind: ErrorKind,
    message: String,
    lineno: Option<usize>,
    name: Option<String>,
    filename: Option<String>,
    templates: Vec<String>,
    traceback: Vec<TraceFrame>,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, message: M) -> Self {
        Self {
            repr: Box::new(ErrorRepr {
                kind,
                message: message.into(),
                lineno: None,
                name: None,
                filename: None,
                templates: Vec::new(),
                traceback: Vec::new(),
            }),
        }
    }

    pub(crate) fn syntax<M: Into<String>>(message: M, lineno: usize) -> Self {
        Self::new(ErrorKind::TemplateSyntax, message).with_lineno(lineno)
    }

    pub(crate) fn assertion<M: Into<String>>(message: M, lineno: usize) -> Self {
        Self::new(ErrorKind::TemplateAssertion, message).with_lineno(lineno)
    }

    pub(crate) fn runtime<M: Into<String>>(message: M) -> Self {
        Self::new(ErrorKind::TemplateRuntime, message)
    }

    pub(crate) fn type_error<M: Into<String>>(message: M) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    /// The error a [`crate::Loader`] returns for a name it does not know.
    pub fn not_found(name: &str) -> Self {
        let mut error = Self::new(ErrorKind::TemplateNotFound, name);
        error.repr.templates.push(name.to_string());
        error
    }

    pub(crate) fn none_found(names: Vec<String>) -> Self {
        let mut error = Self::new(
            ErrorKind::TemplatesNotFound,
            format!(
                "none of the templates given were found: {}",
                names.join(", ")
            ),
        );
        error.repr.templates = names;
        error
    }

    pub(crate) fn with_lineno(mut self, lineno: usize) -> Self {
        self.repr.lineno = Some(lineno);
        self
    }

    /// Fills in the template name and filename unless an inner frame already did.
    pub(crate) fn with_source_info(mut self, name: Option<&str>, filename: Option<&str>) -> Self {
        let repr = &mut *self.repr;
        if repr.name.is_none() && repr.filename.is_none() {
            repr.name = name.map(str::to_string);
            repr.filename = filename.map(str::to_string);
        }
        self
    }

    /// Records a frame while a runtime error unwinds out of a compiled unit.
    pub(crate) fn push_frame(
        mut self,
        name: Option<&str>,
        filename: Option<&str>,
        lineno: usize,
    ) -> Self {
        let repr = &mut *self.repr;
        if repr.traceback.is_empty() && repr.lineno.is_none() {
            repr.lineno = Some(lineno);
            repr.name = name.map(str::to_string);
            repr.filename = filename.map(str::to_string);
        }
        repr.traceback.push(TraceFrame {
            name: name.map(str::to_string),
            filename: filename.map(str::to_string),
            lineno,
        });
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.repr.kind
    }

    pub fn message(&self) -> &str {
        &self.repr.message
    }

    /// The 1-based template line the error was raised on, if known.
    pub fn lineno(&self) -> Option<usize> {
        self.repr.lineno
    }

    pub fn name(&self) -> Option<&str> {
        self.repr.name.as_deref()
    }

    pub fn filename(&self) -> Option<&str> {
        self.repr.filename.as_deref()
    }

    /// The template names that were looked up, for not-found errors.
    pub fn templates(&self) -> &[String] {
        &self.repr.templates
    }

    /// Template frames that were active when the error was raised, innermost first.
    pub fn traceback(&self) -> &[TraceFrame] {
        &self.repr.traceback
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())?;
        match (self.filename().or(self.name()), self.lineno()) {
            (Some(location), Some(lineno)) => write!(f, " (in {} line {})", location, lineno),
            (Some(location), None) => write!(f, " (in {})", location),
            (None, Some(lineno)) => write!(f, " (line {})", lineno),
            (None, None) => Ok(()),
        }
    }
}

impl std::error::Error for Error {}
