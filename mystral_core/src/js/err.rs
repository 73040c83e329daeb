//! Script errors.

/// An exception that crossed from script into the host: message plus
/// whatever location information the engine captured.
#[derive(Debug, Clone)]
pub struct JsError {
  pub message: String,
  pub resource: Option<String>,
  pub line: Option<usize>,
  pub column: Option<usize>,
  pub stack: Option<String>,
}

impl JsError {
  pub fn message(message: impl Into<String>) -> Self {
    JsError {
      message: message.into(),
      resource: None,
      line: None,
      column: None,
      stack: None,
    }
  }

  /// Builds a [`JsError`] from a caught exception value.
  pub(crate) fn from_v8_exception(
    scope: &mut v8::HandleScope,
    exception: v8::Local<v8::Value>,
    prefix: Option<&str>,
  ) -> Self {
    let msg = v8::Exception::create_message(scope, exception);
    let message = format!(
      "{}{}",
      prefix.unwrap_or(""),
      msg.get(scope).to_rust_string_lossy(scope)
    );
    let resource = msg
      .get_script_resource_name(scope)
      .map(|name| name.to_rust_string_lossy(scope));
    let line = msg.get_line_number(scope);
    let column = Some(msg.get_start_column());

    let stack = if exception.is_object() {
      let object = v8::Local::<v8::Object>::try_from(exception).unwrap();
      let key = v8::String::new(scope, "stack").unwrap();
      object
        .get(scope, key.into())
        .filter(|value| value.is_string())
        .map(|value| value.to_rust_string_lossy(scope))
    } else {
      None
    };

    JsError {
      message,
      resource,
      line,
      column,
      stack,
    }
  }
}

impl std::fmt::Display for JsError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if let Some(stack) = &self.stack {
      // The stack string already includes the message line.
      write!(f, "{stack}")
    } else {
      write!(f, "{}", self.message)?;
      if let (Some(resource), Some(line)) = (&self.resource, self.line) {
        write!(f, "\n    at {}:{}", resource, line)?;
        if let Some(column) = self.column {
          write!(f, ":{column}")?;
        }
      }
      Ok(())
    }
  }
}

impl std::error::Error for JsError {}
