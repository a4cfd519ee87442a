use anyhow::Error;
use colored::*;
use serde::Serialize;
use std::borrow::Cow;
use std::fmt::Debug;
use std::fmt::Display;
use std::io;

/// Well-known error kinds a native op can fail with. These are tags, not JS
/// class names: the dispatcher looks up a builder registered (from JS, via
/// `registerErrorClass`) under the matching name and throws whatever error
/// class that builder produces. An unregistered kind falls back to a plain
/// `Error` with a diagnostic prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    ConnectionRefused,
    ConnectionReset,
    ConnectionAborted,
    NotConnected,
    AddrInUse,
    AddrNotAvailable,
    BrokenPipe,
    AlreadyExists,
    InvalidData,
    TimedOut,
    Interrupted,
    WriteZero,
    UnexpectedEof,
    BadResource,
    Http,
    Busy,
    NotSupported,
    // Built-in JS error classes, reachable the same way so native code can
    // throw a `TypeError`/`RangeError`/etc. through the same wire format.
    Error,
    RangeError,
    ReferenceError,
    SyntaxError,
    TypeError,
    UriError,
}

impl ErrorKind {
    /// The tag as it appears on the wire (`$err_class_name`).
    pub fn as_str(&self) -> &'static str {
        use ErrorKind::*;
        match self {
            NotFound => "NotFound",
            PermissionDenied => "PermissionDenied",
            ConnectionRefused => "ConnectionRefused",
            ConnectionReset => "ConnectionReset",
            ConnectionAborted => "ConnectionAborted",
            NotConnected => "NotConnected",
            AddrInUse => "AddrInUse",
            AddrNotAvailable => "AddrNotAvailable",
            BrokenPipe => "BrokenPipe",
            AlreadyExists => "AlreadyExists",
            InvalidData => "InvalidData",
            TimedOut => "TimedOut",
            Interrupted => "Interrupted",
            WriteZero => "WriteZero",
            UnexpectedEof => "UnexpectedEof",
            BadResource => "BadResource",
            Http => "Http",
            Busy => "Busy",
            NotSupported => "NotSupported",
            Error => "Error",
            RangeError => "RangeError",
            ReferenceError => "ReferenceError",
            SyntaxError => "SyntaxError",
            TypeError => "TypeError",
            UriError => "URIError",
        }
    }
}

impl From<io::ErrorKind> for ErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        use io::ErrorKind as IoKind;
        match kind {
            IoKind::NotFound => ErrorKind::NotFound,
            IoKind::PermissionDenied => ErrorKind::PermissionDenied,
            IoKind::ConnectionRefused => ErrorKind::ConnectionRefused,
            IoKind::ConnectionReset => ErrorKind::ConnectionReset,
            IoKind::ConnectionAborted => ErrorKind::ConnectionAborted,
            IoKind::NotConnected => ErrorKind::NotConnected,
            IoKind::AddrInUse => ErrorKind::AddrInUse,
            IoKind::AddrNotAvailable => ErrorKind::AddrNotAvailable,
            IoKind::BrokenPipe => ErrorKind::BrokenPipe,
            IoKind::AlreadyExists => ErrorKind::AlreadyExists,
            IoKind::InvalidData => ErrorKind::InvalidData,
            IoKind::TimedOut => ErrorKind::TimedOut,
            IoKind::Interrupted => ErrorKind::Interrupted,
            IoKind::WriteZero => ErrorKind::WriteZero,
            IoKind::UnexpectedEof => ErrorKind::UnexpectedEof,
            _ => ErrorKind::Error,
        }
    }
}

/// An error produced by a native op handler, wire-encoded as `{
/// $err_class_name: "<kind>", message: "<text>" }` and unwrapped back into a
/// thrown JS error at the `send`/completion boundary.
#[derive(Debug, Clone, Serialize)]
pub struct OpError {
    #[serde(rename = "$err_class_name")]
    pub class: &'static str,
    pub message: String,
}

impl OpError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        OpError {
            class: kind.as_str(),
            message: message.into(),
        }
    }

    pub fn bad_resource(message: impl Into<String>) -> Self {
        OpError::new(ErrorKind::BadResource, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        OpError::new(ErrorKind::TypeError, message)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("OpError always serializes")
    }
}

impl Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class.red().bold(), self.message)
    }
}

impl std::error::Error for OpError {}

impl From<io::Error> for OpError {
    fn from(err: io::Error) -> Self {
        OpError::new(err.kind().into(), err.to_string())
    }
}

/// A simple error type that lets the creator specify both the message and
/// the error class name, for Rust-level (non-op) failures — module
/// resolution, loader errors, bindings setup.
#[derive(Debug)]
pub struct CustomError {
    class: &'static str,
    message: Cow<'static, str>,
}

impl CustomError {
    pub fn new(class: &'static str, message: impl Into<Cow<'static, str>>) -> Error {
        CustomError {
            class,
            message: message.into(),
        }
        .into()
    }
}

impl std::error::Error for CustomError {}

impl Display for CustomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class.red().bold(), self.message)
    }
}

pub fn generic_error(message: impl Into<Cow<'static, str>>) -> Error {
    CustomError::new("Error", message)
}

pub fn type_error(message: impl Into<Cow<'static, str>>) -> Error {
    CustomError::new("TypeError", message)
}

/// Represents a V8 exception, captured either as an uncaught script error or
/// as the reason of an unhandled promise rejection.
#[derive(PartialEq, Clone)]
pub struct JsError {
    pub message: String,
    pub resource_name: String,
    pub source_line: Option<String>,
    pub line_number: Option<i64>,
    pub start_column: Option<i64>,
    pub end_column: Option<i64>,
    pub stack: Option<String>,
}

impl JsError {
    // https://github.com/denoland/rusty_v8/blob/0d093a02f658781d52e6d70d138768fc19a79d54/examples/shell.rs#L158
    pub fn from_v8_exception<'a>(
        scope: &'a mut v8::HandleScope,
        exception: v8::Local<'a, v8::Value>,
        prefix: Option<&str>,
    ) -> Self {
        let scope = &mut v8::HandleScope::new(scope);
        let message = v8::Exception::create_message(scope, exception);

        let exception_string = exception
            .to_string(scope)
            .unwrap()
            .to_rust_string_lossy(scope);

        let exception_string = match prefix {
            Some(prefix) => format!("{prefix}{exception_string}"),
            None => exception_string,
        };

        let resource_name = message.get_script_resource_name(scope).map_or_else(
            || "(unknown)".into(),
            |s| s.to_string(scope).unwrap().to_rust_string_lossy(scope),
        );

        let source_line = message
            .get_source_line(scope)
            .map(|s| s.to_string(scope).unwrap().to_rust_string_lossy(scope));

        let line_number = message
            .get_line_number(scope)
            .and_then(|v| v.try_into().ok());

        let start_column = message.get_start_column().try_into().ok();
        let end_column = message.get_end_column().try_into().ok();

        // Access error.stack (rather than Message::get_stack_trace) to make
        // sure Error.prepareStackTrace(), if the user installed one, ran.
        let stack = v8::Local::<v8::Object>::try_from(exception)
            .ok()
            .and_then(|obj| {
                let key = v8::String::new(scope, "stack").unwrap();
                obj.get(scope, key.into())
            })
            .and_then(|s| v8::Local::<v8::String>::try_from(s).ok())
            .map(|s| s.to_rust_string_lossy(scope));

        JsError {
            message: exception_string,
            resource_name,
            source_line,
            line_number,
            start_column,
            end_column,
            stack,
        }
    }
}

impl std::error::Error for JsError {}

// Minified rendering (used wherever only a single line is wanted).
impl Display for JsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let line = self.line_number.unwrap_or_default();
        let column = self.start_column.unwrap_or_default();
        write!(
            f,
            "{} {} ({}:{}:{})",
            "Uncaught".red().bold(),
            self.message,
            self.resource_name,
            line,
            column
        )
    }
}

// Full rendering with a caret-underlined source span and a dimmed stack trace.
impl Debug for JsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} {}", "Uncaught".red().bold(), self.message)?;

        if let Some(source_line) = self.source_line.as_ref() {
            writeln!(f, "{source_line}")?;

            let start_column = self.start_column.unwrap_or_default();
            let end_column = self.end_column.unwrap_or_default();

            for _ in 0..start_column {
                write!(f, " ")?;
            }
            for _ in start_column..end_column {
                write!(f, "{}", "^".red())?;
            }
            writeln!(f)?;
        }

        if let Some(stack) = self.stack.as_ref() {
            write!(f, "{}", stack.dimmed())?;
        }

        Ok(())
    }
}

pub fn unwrap_or_exit<T>(result: Result<T, Error>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            eprintln!("{e:?}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_error_wire_format() {
        let err = OpError::bad_resource("bad rid: 7");
        let json = err.to_json();
        assert_eq!(json["$err_class_name"], "BadResource");
        assert_eq!(json["message"], "bad rid: 7");
    }

    #[test]
    fn io_error_kind_maps_through() {
        let io_err = io::Error::from(io::ErrorKind::NotFound);
        let op_err: OpError = io_err.into();
        assert_eq!(op_err.class, "NotFound");
    }
}
