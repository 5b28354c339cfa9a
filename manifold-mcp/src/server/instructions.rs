//! Instruction aggregation collaborator
//!
//! Upstreams report free-form instruction text during their handshake. The
//! renderer turns the ordered collection into the single string advertised
//! downstream. Template engines live outside the core; the built-in
//! implementation forwards every upstream block verbatim.

/// Renders the instruction text advertised to downstream clients
pub trait InstructionRenderer: Send + Sync {
    /// `upstream_instructions` is (upstream name, verbatim text) in
    /// aggregation order; `custom_template` is the session's opaque template,
    /// if any.
    fn render(
        &self,
        upstream_instructions: &[(String, String)],
        custom_template: Option<&str>,
    ) -> String;
}

/// Default renderer: upstream blocks verbatim under per-upstream headers
#[derive(Debug, Default, Clone)]
pub struct PassthroughInstructions;

impl InstructionRenderer for PassthroughInstructions {
    fn render(
        &self,
        upstream_instructions: &[(String, String)],
        _custom_template: Option<&str>,
    ) -> String {
        let mut out = String::new();
        for (name, text) in upstream_instructions {
            if text.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&format!("## {}\n{}", name, text));
        }
        out
    }
}
