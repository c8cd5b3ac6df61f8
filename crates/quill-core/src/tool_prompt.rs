//! Tool protocol generator.
//!
//! Renders the tool-description block injected into the system prompt and
//! recognises tool invocations in raw generated text, both driven by a
//! [`ToolProtocolConfig`].  Extraction patterns are compiled once, when the
//! generator is built.

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::error::ConfigError;
use crate::template::ToolProtocolConfig;
use crate::types::{ChoiceMode, ToolDeclaration, ToolInvocation};

/// Argument captures that mean "no arguments".
const NULL_ARGUMENTS: [&str; 3] = ["null", "{}", "[]"];

/// One protocol with its extraction pattern compiled.
#[derive(Debug, Clone)]
pub struct ToolProtocol {
    index: usize,
    config: ToolProtocolConfig,
    pattern: Regex,
}

impl ToolProtocol {
    fn compile(index: usize, config: ToolProtocolConfig) -> Result<Self, ConfigError> {
        let pattern = RegexBuilder::new(&config.extraction_pattern)
            .dot_matches_new_line(true)
            .build()
            .map_err(|source| ConfigError::InvalidPattern { index, source })?;
        Ok(Self {
            index,
            config,
            pattern,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn config(&self) -> &ToolProtocolConfig {
        &self.config
    }

    pub fn stop_words(&self) -> &[String] {
        &self.config.stop_words
    }

    pub fn result_split_marker(&self) -> &str {
        &self.config.result_split_marker
    }

    /// Whether the joined, trimmed prefix starts with the name placeholder.
    ///
    /// Only the head of the text is inspected, so the answer is stable once
    /// the first few fragments are known.
    pub fn classify_prefix<S: AsRef<str>>(&self, prefix: &[S]) -> bool {
        let joined: String = prefix.iter().map(AsRef::as_ref).collect();
        joined.trim().starts_with(&self.config.name_placeholder)
    }

    /// One invocation per match in `raw`, in text order, with fresh ids.
    ///
    /// Names are trimmed; a match whose name group is empty still yields an
    /// invocation, which no registered tool can answer.
    pub fn extract_invocations(&self, raw: &str) -> Vec<ToolInvocation> {
        let args_group = self.config.args_group;
        let invocations: Vec<_> = self
            .pattern
            .captures_iter(raw)
            .map(|caps| {
                let name = caps.get(1).map_or("", |m| m.as_str().trim());
                let arguments = caps
                    .get(args_group)
                    .map(|m| m.as_str())
                    .filter(|text| !is_null_arguments(text))
                    .map(str::to_owned);
                ToolInvocation::new(ToolInvocation::new_id(), name, arguments)
            })
            .collect();
        if !invocations.is_empty() {
            debug!(
                protocol = self.index,
                count = invocations.len(),
                names = ?invocations.iter().map(ToolInvocation::name).collect::<Vec<_>>(),
                "extracted tool invocations"
            );
        }
        invocations
    }

    /// A call rendered with the protocol's call template.
    pub fn render_call(&self, invocation: &ToolInvocation) -> String {
        format_slots(
            &self.config.call_template,
            &[invocation.name(), invocation.arguments().unwrap_or("")],
        )
    }

    /// A tool output rendered with the protocol's result template.
    pub fn render_result(&self, text: &str) -> String {
        format_slots(&self.config.result_template, &[text])
    }

    /// The model's reply after tool results, introduced by the exit marker.
    pub fn render_call_return(&self, text: &str) -> String {
        format!("{}: {}", self.config.exit_marker, text)
    }

    /// The system-prompt block describing `declarations`.
    ///
    /// Empty when there is nothing to describe or `mode` is
    /// [`ChoiceMode::None`].
    pub fn build_tool_prompt(
        &self,
        declarations: &[ToolDeclaration],
        lang: &str,
        mode: ChoiceMode,
    ) -> Result<String, ConfigError> {
        if declarations.is_empty() || mode == ChoiceMode::None {
            return Ok(String::new());
        }
        let cfg = &self.config;

        let info = self.lookup(&cfg.call_template_info, "call_template_info", lang)?;
        let fmt = if mode == ChoiceMode::Parallel {
            self.lookup(&cfg.call_template_fmt_para, "call_template_fmt_para", lang)?
        } else {
            self.lookup(&cfg.call_template_fmt, "call_template_fmt", lang)?
        };
        // An empty description table means "always dump JSON"; a populated one
        // must cover the language.
        let desc_template = if cfg.tool_desc_template.is_empty() {
            ""
        } else {
            self.lookup(&cfg.tool_desc_template, "tool_desc_template", lang)?
        };

        let mut tool_descs = declarations
            .iter()
            .map(|decl| describe_declaration(decl, desc_template))
            .collect::<Vec<_>>()
            .join("\n\n");

        tool_descs.push_str(
            "\n\n**Important**: Only use the tools explicitly provided in this list. \
             Do not suggest or create tools that are not defined here.",
        );
        tool_descs.push_str("\n\nWhen determining which tool to use:");
        for (n, decl) in declarations.iter().enumerate() {
            let description = decl
                .description
                .as_deref()
                .unwrap_or("No description provided.");
            tool_descs.push_str(&format!("\n{}. Use **{}** for {}.", n + 1, decl.name, description));
        }
        tool_descs.push_str(&format!(
            "\n{}. If the query does not match any available tool, respond as a helpful \
             assistant in a conversational manner without suggesting tools or requiring a tool call.",
            declarations.len() + 1
        ));

        let system = info.replace("{tool_descs}", &tool_descs);
        let names = declarations
            .iter()
            .map(|decl| decl.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let call_format = format_slots(
            fmt,
            &[
                &cfg.name_placeholder,
                &cfg.args_placeholder,
                &cfg.result_placeholder,
                &cfg.exit_marker,
                &names,
            ],
        );

        Ok(format!("\n\n{system}\n\n{call_format}"))
    }

    /// Fails unless every mandatory per-language table has `lang`.
    pub fn check_language(&self, lang: &str) -> Result<(), ConfigError> {
        let cfg = &self.config;
        self.lookup(&cfg.call_template_info, "call_template_info", lang)?;
        self.lookup(&cfg.call_template_fmt, "call_template_fmt", lang)?;
        self.lookup(&cfg.call_template_fmt_para, "call_template_fmt_para", lang)?;
        if !cfg.tool_desc_template.is_empty() {
            self.lookup(&cfg.tool_desc_template, "tool_desc_template", lang)?;
        }
        Ok(())
    }

    fn lookup<'a>(
        &self,
        table: &'a std::collections::HashMap<String, String>,
        table_name: &'static str,
        lang: &str,
    ) -> Result<&'a str, ConfigError> {
        table
            .get(lang)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::MissingLanguage {
                index: self.index,
                table: table_name,
                lang: lang.to_owned(),
            })
    }
}

/// The protocol table, indexed by position.
#[derive(Debug, Clone)]
pub struct ToolPromptGenerator {
    protocols: Vec<ToolProtocol>,
}

impl ToolPromptGenerator {
    /// Compile every protocol's extraction pattern.
    pub fn new(protocols: Vec<ToolProtocolConfig>) -> Result<Self, ConfigError> {
        let protocols = protocols
            .into_iter()
            .enumerate()
            .map(|(index, config)| ToolProtocol::compile(index, config))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { protocols })
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    /// The protocol at `index`.
    pub fn protocol(&self, index: usize) -> Result<&ToolProtocol, ConfigError> {
        if self.protocols.is_empty() {
            return Err(ConfigError::NoProtocols);
        }
        self.protocols
            .get(index)
            .ok_or(ConfigError::ProtocolIndexOutOfRange {
                index,
                len: self.protocols.len(),
            })
    }

    pub fn config(&self, index: usize) -> Result<&ToolProtocolConfig, ConfigError> {
        Ok(self.protocol(index)?.config())
    }

    pub fn stop_words(&self, index: usize) -> Result<&[String], ConfigError> {
        Ok(self.protocol(index)?.stop_words())
    }

    pub fn result_split_marker(&self, index: usize) -> Result<&str, ConfigError> {
        Ok(self.protocol(index)?.result_split_marker())
    }

    pub fn build_tool_prompt(
        &self,
        declarations: &[ToolDeclaration],
        index: usize,
        lang: &str,
        mode: ChoiceMode,
    ) -> Result<String, ConfigError> {
        if declarations.is_empty() || mode == ChoiceMode::None {
            return Ok(String::new());
        }
        self.protocol(index)?.build_tool_prompt(declarations, lang, mode)
    }

    pub fn extract_invocations(
        &self,
        raw: &str,
        index: usize,
    ) -> Result<Vec<ToolInvocation>, ConfigError> {
        Ok(self.protocol(index)?.extract_invocations(raw))
    }

    pub fn classify_prefix<S: AsRef<str>>(
        &self,
        prefix: &[S],
        index: usize,
    ) -> Result<bool, ConfigError> {
        Ok(self.protocol(index)?.classify_prefix(prefix))
    }
}

fn is_null_arguments(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty() || NULL_ARGUMENTS.contains(&trimmed)
}

/// Human-readable description of one declaration, or a JSON dump when no
/// template applies.
fn describe_declaration(decl: &ToolDeclaration, template: &str) -> String {
    if template.trim().is_empty() {
        return json!({ "type": "function", "function": decl }).to_string();
    }
    let description = decl.description.as_deref().unwrap_or("");
    let properties = required_marked_properties(decl.parameters.as_ref())
        .map(|props| Value::Object(props).to_string())
        .unwrap_or_default();
    format_slots(template, &[&decl.name, &decl.name, description, &properties])
        .trim()
        .to_owned()
}

/// The schema's `properties`, with `"required": true` added to every
/// property listed in `required`.  `None` when there are no properties.
fn required_marked_properties(parameters: Option<&Value>) -> Option<Map<String, Value>> {
    let schema = parameters?.as_object()?;
    let mut properties = schema.get("properties")?.as_object()?.clone();
    if properties.is_empty() {
        return None;
    }
    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str);
    for key in required {
        if let Some(Value::Object(prop)) = properties.get_mut(key) {
            prop.insert("required".to_owned(), Value::Bool(true));
        }
    }
    Some(properties)
}

/// Positional `{N}` substitution with `{{` / `}}` escapes.
///
/// Anything between braces that is not an in-range index is kept literally,
/// so named placeholders such as `{tool_descs}` pass through untouched.
pub fn format_slots(template: &str, args: &[&str]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("{{") {
            out.push('{');
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            out.push('}');
            rest = &tail[2..];
        } else if tail.starts_with('{') {
            let slot = tail[1..]
                .find('}')
                .and_then(|end| Some((tail[1..1 + end].parse::<usize>().ok()?, end)))
                .and_then(|(n, end)| Some((*args.get(n)?, end)));
            match slot {
                Some((value, end)) => {
                    out.push_str(value);
                    rest = &tail[end + 2..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        } else {
            out.push('}');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::template::default_protocols;

    fn en(s: &str) -> HashMap<String, String> {
        HashMap::from([("en".to_owned(), s.to_owned())])
    }

    fn test_protocol() -> ToolProtocolConfig {
        ToolProtocolConfig {
            description: "test".into(),
            name_placeholder: "FN_NAME".into(),
            args_placeholder: "FN_ARGS".into(),
            result_placeholder: "FN_RESULT".into(),
            exit_marker: "FN_EXIT".into(),
            call_template: "FN_NAME: {0}\nFN_ARGS: {1}".into(),
            result_template: "FN_RESULT: {0}".into(),
            result_split_marker: "\n".into(),
            extraction_pattern: r"FN_NAME:\s*(\S+)\s*\nFN_ARGS:[ \t]*([^\n]*)".into(),
            args_group: 2,
            stop_words: vec!["FN_RESULT".into(), "FN_EXIT".into()],
            call_template_info: en("# Tools\n{tool_descs}"),
            call_template_fmt: en("seq {0}/{1}/{2}/{3} [{4}]"),
            call_template_fmt_para: en("{0}:{1}:{2}:{3} tools={4}"),
            tool_desc_template: HashMap::new(),
        }
    }

    fn generator() -> ToolPromptGenerator {
        ToolPromptGenerator::new(vec![test_protocol()]).expect("valid protocol")
    }

    #[test]
    fn parallel_format_substitutes_placeholders() {
        let prompt = generator()
            .build_tool_prompt(&[ToolDeclaration::new("lookup")], 0, "en", ChoiceMode::Parallel)
            .unwrap();
        assert_eq!(
            prompt.lines().last(),
            Some("FN_NAME:FN_ARGS:FN_RESULT:FN_EXIT tools=lookup")
        );
        assert!(prompt.starts_with("\n\n# Tools\n"));
    }

    #[test]
    fn sequential_format_joins_names() {
        let decls = [ToolDeclaration::new("a"), ToolDeclaration::new("b")];
        let prompt = generator()
            .build_tool_prompt(&decls, 0, "en", ChoiceMode::Auto)
            .unwrap();
        assert!(prompt.ends_with("\n\nseq FN_NAME/FN_ARGS/FN_RESULT/FN_EXIT [a, b]"));
        assert!(prompt.contains("\n1. Use **a** for No description provided."));
        assert!(prompt.contains("\n3. If the query does not match any available tool"));
    }

    #[test]
    fn empty_when_no_tools_or_choice_none() {
        let g = generator();
        assert_eq!(g.build_tool_prompt(&[], 0, "en", ChoiceMode::Auto).unwrap(), "");
        assert_eq!(
            g.build_tool_prompt(&[ToolDeclaration::new("x")], 0, "en", ChoiceMode::None)
                .unwrap(),
            ""
        );
    }

    #[test]
    fn missing_language_is_fatal() {
        let err = generator()
            .build_tool_prompt(&[ToolDeclaration::new("x")], 0, "fr", ChoiceMode::Auto)
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingLanguage { table: "call_template_info", .. }));
    }

    #[test]
    fn protocol_index_out_of_range_is_fatal() {
        let err = generator().stop_words(3).unwrap_err();
        assert!(matches!(err, ConfigError::ProtocolIndexOutOfRange { index: 3, len: 1 }));
        let empty = ToolPromptGenerator::new(Vec::new()).unwrap();
        assert!(matches!(empty.protocol(0), Err(ConfigError::NoProtocols)));
    }

    #[test]
    fn invalid_pattern_is_reported_at_construction() {
        let mut cfg = test_protocol();
        cfg.extraction_pattern = "(unclosed".into();
        let err = ToolPromptGenerator::new(vec![cfg]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { index: 0, .. }));
    }

    #[test]
    fn description_falls_back_to_json_dump() {
        let decl = ToolDeclaration::new("lookup").with_description("find things");
        let prompt = generator()
            .build_tool_prompt(&[decl], 0, "en", ChoiceMode::Auto)
            .unwrap();
        assert!(prompt.contains(
            r#"{"type":"function","function":{"name":"lookup","description":"find things"}}"#
        ));
    }

    #[test]
    fn description_template_marks_required_properties() {
        let mut cfg = test_protocol();
        cfg.tool_desc_template = en("### {0}\n{1}: {2} Parameters: {3}");
        let g = ToolPromptGenerator::new(vec![cfg]).unwrap();
        let decl = ToolDeclaration::new("weather")
            .with_description("Current weather.")
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "city": {"type": "string"},
                    "unit": {"type": "string"}
                },
                "required": ["city"]
            }));
        let prompt = g.build_tool_prompt(&[decl], 0, "en", ChoiceMode::Auto).unwrap();
        assert!(prompt.contains(
            r#"### weather
weather: Current weather. Parameters: {"city":{"type":"string","required":true},"unit":{"type":"string"}}"#
        ));
    }

    #[test]
    fn description_without_properties_is_trimmed() {
        let mut cfg = test_protocol();
        cfg.tool_desc_template = en("{1}: {2} Parameters: {3}");
        let g = ToolPromptGenerator::new(vec![cfg]).unwrap();
        let prompt = g
            .build_tool_prompt(&[ToolDeclaration::new("ping")], 0, "en", ChoiceMode::Auto)
            .unwrap();
        assert!(prompt.contains("ping:  Parameters:\n\n**Important**"));
    }

    #[test]
    fn null_like_arguments_are_absent() {
        let g = generator();
        for args in ["", "   ", "null", "{}", "[]", " {} "] {
            let raw = format!("FN_NAME: lookup\nFN_ARGS: {args}");
            let calls = g.extract_invocations(&raw, 0).unwrap();
            assert_eq!(calls.len(), 1, "args {args:?}");
            assert_eq!(calls[0].arguments(), None, "args {args:?}");
        }
    }

    #[test]
    fn arguments_are_kept_verbatim() {
        let raw = "FN_NAME: lookup\nFN_ARGS: {\"q\": \"rust\"}  ";
        let calls = generator().extract_invocations(raw, 0).unwrap();
        assert_eq!(calls[0].name(), "lookup");
        assert_eq!(calls[0].arguments(), Some("{\"q\": \"rust\"}  "));
        assert!(calls[0].id.starts_with("call_"));
    }

    #[test]
    fn multiple_matches_keep_text_order() {
        let raw = "FN_NAME: first\nFN_ARGS: 1\nFN_NAME: second\nFN_ARGS: 2";
        let calls = generator().extract_invocations(raw, 0).unwrap();
        let names: Vec<_> = calls.iter().map(ToolInvocation::name).collect();
        assert_eq!(names, ["first", "second"]);
        assert_ne!(calls[0].id, calls[1].id);
    }

    #[test]
    fn every_match_yields_an_invocation() {
        let mut cfg = test_protocol();
        cfg.extraction_pattern = r"N:([^|]*)\|A:([^;]*);".into();
        let g = ToolPromptGenerator::new(vec![cfg]).unwrap();
        let calls = g.extract_invocations("N: ping |A:1; N:|A:2;", 0).unwrap();
        let names: Vec<_> = calls.iter().map(ToolInvocation::name).collect();
        assert_eq!(names, ["ping", ""]);
        assert_eq!(calls[1].arguments(), Some("2"));
    }

    #[test]
    fn classify_prefix_trims_and_tests_start() {
        let g = generator();
        assert!(g.classify_prefix(&[" FN_", "NAME", ":"], 0).unwrap());
        assert!(!g.classify_prefix(&["Hel", "lo", " FN_NAME"], 0).unwrap());
    }

    #[test]
    fn renders_calls_results_and_returns() {
        let g = generator();
        let protocol = g.protocol(0).unwrap();
        let call = ToolInvocation::new("call_1", "lookup", None);
        assert_eq!(protocol.render_call(&call), "FN_NAME: lookup\nFN_ARGS: ");
        assert_eq!(protocol.render_result("42"), "FN_RESULT: 42");
        assert_eq!(protocol.render_call_return("done"), "FN_EXIT: done");
    }

    #[test]
    fn builtin_protocol_extracts_multiline_arguments() {
        let g = ToolPromptGenerator::new(default_protocols()).unwrap();
        let raw = "✿FUNCTION✿: get_weather\n✿ARGS✿: {\n  \"city\": \"Paris\"\n}\n✿FUNCTION✿: get_time\n✿ARGS✿: {}";
        let calls = g.extract_invocations(raw, 0).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name(), "get_weather");
        assert_eq!(calls[0].arguments(), Some("{\n  \"city\": \"Paris\"\n}"));
        assert_eq!(calls[1].name(), "get_time");
        assert_eq!(calls[1].arguments(), None);
    }

    #[test]
    fn format_slots_handles_escapes_and_unknown_slots() {
        assert_eq!(format_slots("{0}-{1}", &["a", "b"]), "a-b");
        assert_eq!(format_slots("{{{0}}}", &["x"]), "{x}");
        assert_eq!(format_slots("{tool_descs} {5}", &["x"]), "{tool_descs} {5}");
        assert_eq!(format_slots("✿{0}✿", &["é"]), "✿é✿");
    }
}
