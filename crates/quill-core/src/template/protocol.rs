use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Textual convention used to express tool calls inside plain generated text.
///
/// Templates use positional `{N}` slots.  Per-language tables are keyed by a
/// language code such as `"en"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolProtocolConfig {
    /// Free-form label shown in logs.
    #[serde(default)]
    pub description: String,
    pub name_placeholder: String,
    pub args_placeholder: String,
    pub result_placeholder: String,
    /// Marker that introduces the model's reply after tool results.
    pub exit_marker: String,
    /// `{0}` = function name, `{1}` = arguments.
    pub call_template: String,
    /// `{0}` = tool output.
    pub result_template: String,
    /// Appended after the calls of an assistant turn, before results.
    #[serde(default)]
    pub result_split_marker: String,
    /// Regular expression; group 1 captures the name, `args_group` the
    /// arguments.
    pub extraction_pattern: String,
    #[serde(default = "default_args_group")]
    pub args_group: usize,
    #[serde(default)]
    pub stop_words: Vec<String>,
    /// System-prompt wrapper; `{tool_descs}` receives the tool descriptions.
    pub call_template_info: HashMap<String, String>,
    /// Sequential call instructions: `{0}`..`{3}` are the name, args, result
    /// and exit markers, `{4}` the comma-joined tool names.
    pub call_template_fmt: HashMap<String, String>,
    /// Parallel variant of `call_template_fmt`.
    pub call_template_fmt_para: HashMap<String, String>,
    /// Per-tool description: `{0}` human name, `{1}` model name,
    /// `{2}` description, `{3}` parameters JSON.  Blank or absent falls back
    /// to a JSON dump of the declaration.
    #[serde(default)]
    pub tool_desc_template: HashMap<String, String>,
}

fn default_args_group() -> usize {
    2
}

const QWEN_INFO_EN: &str = "# Tools\n\n## You have access to the following tools:\n\n{tool_descs}";

const QWEN_FMT_EN: &str = "## When you need to call a tool, please insert the following command in your reply, \
which can be called zero or multiple times according to your needs:\n\n\
{0}: The tool to use, should be one of [{4}]\n\
{1}: The input of the tool\n\
{2}: Tool results\n\
{3}: Reply based on tool results. Images need to be rendered as ![](url)";

const QWEN_FMT_PARA_EN: &str = "## Insert the following command in your reply when you need to call N tools in parallel:\n\n\
{0}: The name of tool 1, should be one of [{4}]\n\
{1}: The input of tool 1\n\
{0}: The name of tool 2\n\
{1}: The input of tool 2\n\
...\n\
{0}: The name of tool N\n\
{1}: The input of tool N\n\
{2}: The result of tool 1\n\
{2}: The result of tool 2\n\
...\n\
{2}: The result of tool N\n\
{3}: Reply based on tool results. Images need to be rendered as ![](url)";

const QWEN_DESC_EN: &str = "### {0}\n\n{1}: {2} Parameters: {3}";

/// The built-in protocol table: a single `✿FUNCTION✿` convention.
pub fn default_protocols() -> Vec<ToolProtocolConfig> {
    let en = |s: &str| HashMap::from([("en".to_owned(), s.to_owned())]);
    vec![ToolProtocolConfig {
        description: "qwen-style function calling".into(),
        name_placeholder: "✿FUNCTION✿".into(),
        args_placeholder: "✿ARGS✿".into(),
        result_placeholder: "✿RESULT✿".into(),
        exit_marker: "✿RETURN✿".into(),
        call_template: "✿FUNCTION✿: {0}\n✿ARGS✿: {1}".into(),
        result_template: "✿RESULT✿: {0}".into(),
        result_split_marker: String::new(),
        extraction_pattern: r"✿FUNCTION✿:\s*([^\n]+?)\s*\n✿ARGS✿:[ \t]*((?:[^\n✿]|\n[^✿])*)".into(),
        args_group: 2,
        stop_words: vec!["✿RESULT✿".into(), "✿RETURN✿".into()],
        call_template_info: en(QWEN_INFO_EN),
        call_template_fmt: en(QWEN_FMT_EN),
        call_template_fmt_para: en(QWEN_FMT_PARA_EN),
        tool_desc_template: en(QWEN_DESC_EN),
    }]
}
