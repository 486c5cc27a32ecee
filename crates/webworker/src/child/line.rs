//! Line-oriented worker scripts.
//!
//! Lets the bundled launcher run workers without an embedded script engine.
//! One directive per line; blank lines and lines starting with `#` or `//`
//! are ignored.
//!
//! ```text
//! post <json>                 post a message to the master
//! throw <message>             raise an uncaught error here
//! onmessage <reply>           answer every message with <reply>
//! onconnect <reply>           on connect, answer the port's messages with <reply>
//! onerror post                catch errors and post them as messages
//! onclose exit|linger <ms>    on CLOSE, exit now or keep running for <ms>
//! expect-name <name>          fail unless the shared worker name matches
//! close                       stop here and exit
//! ```
//!
//! A `<reply>` is `echo`, `swap` (reverse an array or string), `sum` (add an
//! array of numbers), `fd-write` (write the JSON data into the received
//! descriptor), `fd-echo` (post the data back with the received descriptor)
//! or `throw <message>`.

use std::fs::File;
use std::io::Write;
use std::os::fd::OwnedFd;
use std::time::Duration;

use serde_json::{Value, json};
use url::Url;
use webworker_proto::ErrorInfo;

use super::runtime::ScriptHost;
use super::scope::{ScriptResult, WorkerScope};
use crate::event::MessageEvent;

/// [`ScriptHost`] for line-oriented scripts.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineScriptHost;

impl LineScriptHost {
	#[must_use]
	pub fn new() -> Self {
		Self
	}
}

/// Position of a directive, used for error reports.
#[derive(Debug, Clone)]
struct At {
	filename: String,
	line: u32,
}

impl At {
	fn error(&self, message: impl Into<String>) -> ErrorInfo {
		ErrorInfo::new(message, self.filename.clone(), self.line)
	}
}

#[derive(Debug, Clone)]
enum Reply {
	Echo,
	Swap,
	Sum,
	FdWrite,
	FdEcho,
	Throw(ErrorInfo),
}

impl Reply {
	fn parse(text: &str, at: &At) -> Result<Self, ErrorInfo> {
		let (kind, rest) = split_directive(text);
		match kind {
			"echo" => Ok(Self::Echo),
			"swap" => Ok(Self::Swap),
			"sum" => Ok(Self::Sum),
			"fd-write" => Ok(Self::FdWrite),
			"fd-echo" => Ok(Self::FdEcho),
			"throw" => Ok(Self::Throw(at.error(rest))),
			other => Err(at.error(format!("unknown reply '{other}'"))),
		}
	}

	fn apply(&self, scope: &WorkerScope, event: MessageEvent, at: &At) -> ScriptResult {
		match self {
			Self::Echo => scope.post_message(event.data),
			Self::Swap => scope.post_message(swap(event.data)),
			Self::Sum => scope.post_message(sum(&event.data).ok_or_else(|| at.error("sum expects an array of numbers"))?),
			Self::FdWrite => {
				File::from(received_fd(&event, at)?)
					.write_all(event.data.to_string().as_bytes())
					.map_err(|e| at.error(format!("cannot write descriptor: {e}")))?;
			}
			Self::FdEcho => {
				let fd = received_fd(&event, at)?;
				scope.post_message_with_fd(event.data, fd);
			}
			Self::Throw(error) => return Err(error.clone()),
		}
		Ok(())
	}
}

fn received_fd(event: &MessageEvent, at: &At) -> Result<OwnedFd, ErrorInfo> {
	event
		.descriptor
		.as_ref()
		.ok_or_else(|| at.error("message carried no descriptor"))?
		.try_clone_owned()
		.map_err(|e| at.error(format!("cannot duplicate descriptor: {e}")))
}

fn swap(data: Value) -> Value {
	match data {
		Value::Array(mut items) => {
			items.reverse();
			Value::Array(items)
		}
		Value::String(s) => Value::String(s.chars().rev().collect()),
		other => other,
	}
}

fn sum(data: &Value) -> Option<Value> {
	let items = data.as_array()?;
	if let Some(ints) = items.iter().map(Value::as_i64).collect::<Option<Vec<_>>>() {
		return Some(json!(ints.iter().sum::<i64>()));
	}
	let floats = items.iter().map(Value::as_f64).collect::<Option<Vec<_>>>()?;
	Some(json!(floats.iter().sum::<f64>()))
}

fn split_directive(line: &str) -> (&str, &str) {
	line.split_once(char::is_whitespace)
		.map_or((line, ""), |(head, rest)| (head, rest.trim()))
}

impl ScriptHost for LineScriptHost {
	fn run(&mut self, scope: &WorkerScope, source: &str, location: &Url) -> ScriptResult {
		let filename = location.path().to_string();
		for (index, line) in source.lines().enumerate() {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
				continue;
			}
			let at = At {
				filename: filename.clone(),
				line: u32::try_from(index + 1).unwrap_or(u32::MAX),
			};
			let (directive, rest) = split_directive(line);
			match directive {
				"post" => {
					let data: Value =
						serde_json::from_str(rest).map_err(|e| at.error(format!("invalid JSON: {e}")))?;
					scope.post_message(data);
				}
				"throw" => return Err(at.error(rest)),
				"onmessage" => {
					let reply = Reply::parse(rest, &at)?;
					scope.set_onmessage(move |scope, event| reply.apply(scope, event, &at));
				}
				"onconnect" => {
					let reply = Reply::parse(rest, &at)?;
					scope.set_onconnect(move |_, port| {
						let (reply, at) = (reply.clone(), at.clone());
						port.set_onmessage(move |scope, event| reply.apply(scope, event, &at));
						Ok(())
					});
				}
				"onerror" if rest == "post" => scope.set_onerror(|scope, error| {
					scope.post_message(json!({ "error": error.message, "line": error.line }));
					Ok(())
				}),
				"onclose" => match split_directive(rest) {
					("exit", _) => scope.set_onclose(|scope| {
						scope.close();
						Ok(())
					}),
					("linger", ms) => {
						let ms: u64 = ms.parse().map_err(|_| at.error(format!("invalid linger '{ms}'")))?;
						scope.set_onclose(move |scope| {
							scope.set_timeout(Duration::from_millis(ms), |_| Ok(()));
							Ok(())
						});
					}
					_ => return Err(at.error(format!("invalid onclose '{rest}'"))),
				},
				"expect-name" => {
					if scope.name() != Some(rest) {
						return Err(at.error(format!("expected name '{rest}', got {:?}", scope.name())));
					}
				}
				"close" => {
					scope.close();
					return Ok(());
				}
				other => return Err(at.error(format!("unknown directive '{other}'"))),
			}
		}
		Ok(())
	}
}
