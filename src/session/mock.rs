//! In-process TSP instrument simulator
//!
//! `MockInstrument` implements [`Transport`] and models just enough of a
//! TSP-Link instrument group for the script protocols to run against it
//! without hardware:
//! - globals and named user scripts per node (loaded, saved, autorun, byte code)
//! - the error queue, `localnode.showerrors` and `localnode.prompts`
//! - per-node data queues and `node[n].execute(...)` script transfers
//! - `*OPC`, `*ESE`, `*SRE`, `*ESR?` and the status byte
//! - call logging and failure injection for test verification
//!
//! The handle is cheap to clone; clones share the same simulated instrument,
//! so a test keeps one clone for inspection while the session owns another.
//!
//! # Example
//!
//! ```
//! use tsp_firmware::session::MockInstrument;
//!
//! let mock = MockInstrument::new();
//! mock.define(1, "foo");
//! assert!(mock.is_defined(1, "foo"));
//! assert!(mock.writes().is_empty());
//! ```

use super::syntax;
use super::Transport;
use crate::error::{TspError, TspResult};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

macro_rules! pattern {
    ($name:ident, $re:expr) => {
        #[allow(clippy::expect_used)]
        static $name: Lazy<Regex> = Lazy::new(|| Regex::new($re).expect("valid pattern"));
    };
}

pattern!(LOADSCRIPT, r"^loadscript\s+(\w+)\s*$");
pattern!(IS_NIL_GETGLOBAL, r"^_G\.print\(node\[(\d+)\]\.getglobal\('([\w.]+)'\)==nil\)$");
pattern!(IS_NIL_NODE, r"^_G\.print\(node\[(\d+)\]\.([\w.]+)==nil\)$");
pattern!(IS_NIL, r"^_G\.print\(([\w.]+)==nil\)$");
pattern!(SHOW_ERRORS_SET, r"^localnode\.showerrors=(\d)$");
pattern!(PROMPTS_SET, r"^localnode\.prompts=(\d)$");
pattern!(ESE_SET, r"^\*ESE (\d+)$");
pattern!(SRE_SET, r"^\*SRE (\d+)$");
pattern!(DATA_QUEUE_COUNT, r"^_G\.print\(node\[(\d+)\]\.dataqueue\.count\)$");
pattern!(DATA_QUEUE_CLEAR, r"^node\[(\d+)\]\.dataqueue\.clear\(\) waitcomplete\(\d+\)$");
pattern!(DATA_QUEUE_ADD_SOURCE, r"^node\[(\d+)\]\.dataqueue\.add\((\w+)\.source\) waitcomplete\(\)$");
pattern!(
    SCRIPT_NEW_FROM_QUEUE,
    r"^node\[(\d+)\]\.execute\('waitcomplete\(\) (\w+)=script\.new\(dataqueue\.next\(\),\[\[(\w+)\]\]\)'\)$"
);
pattern!(
    CATALOG_ON_NODE,
    r"^node\[(\d+)\]\.execute\(.*script\.user\.catalog\(\).*dataqueue\.add\(s\)"
);
pattern!(
    ALIAS_ON_NODE,
    r"^node\[(\d+)\]\.execute\('(\w+)=script\.user\.scripts\.(\w+) waitcomplete\(\)'\) waitcomplete\(\d+\)$"
);
pattern!(ALIAS, r"^(\w+) = script\.user\.scripts\.(\w+) waitcomplete\(\)$");
pattern!(NIL_ON_NODE, r"^node\[(\d+)\]\.execute\('([\w.]+)=nil'\) waitcomplete\(\d+\)$");
pattern!(NIL, r"^([\w.]+) = nil$");
pattern!(RUN, r"^(\w+)\.run\(\) _G\.waitcomplete\(\)$");
pattern!(UPLOAD_HELPER, r"^([\w.]+)\(node\[(\d+)\],(\w+)\) waitcomplete\(0\)$");
pattern!(
    SAVE_ON_NODE,
    r#"^node\[(\d+)\]\.execute\('(?:(\w+)\.autorun="yes" )?(\w+)\.save\(\)'\) waitcomplete\(\d+\)$"#
);
pattern!(SAVE, r"^(?:(\w+)\.autorun='yes' )?(\w+)\.save\(\)$");
pattern!(NIL_SOURCE, r"^(\w+)\.source=nil waitcomplete\(\)$");
pattern!(NIL_SOURCE_ON_NODE, r"^node\[(\d+)\]\.execute\('(\w+)\.source=nil'\) waitcomplete\(\d+\)$");
pattern!(RESET_ON_NODE, r"^node\[(\d+)\]\.execute\('localnode\.reset\(\)'\) waitcomplete\(\d+\)$");
pattern!(PRINT_SOURCE, r"^do local n=0 for l in string\.gmatch\((\w+)\.source");
pattern!(CONVERT_WITH_FUNCTION, r"^([A-Za-z_][\w.]*)\((\w+)\) waitcomplete\(\)$");
pattern!(NAMESPACE_DEFINITION, r"^\s*([A-Za-z_][\w.]*)\s*=\s*\{");
pattern!(FUNCTION_DEFINITION, r"^\s*function\s+([A-Za-z_][\w.]*)\s*\(");
pattern!(LOADER_OPEN, r"^node\[(\d+)\]\.execute\(\[==\[(\w+)=script\.new\(\[=\[$");
pattern!(LOADER_CLOSE, r"^\]=\],'(\w+)'\)\]==\]\)");

const SYNTAX_ERROR_CODE: i32 = -285;
const RUNTIME_ERROR_CODE: i32 = -286;

/// Snapshot of a simulated user script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockScript {
    /// Script body lines as received.
    pub body: Vec<String>,
    /// Saved to non-volatile memory.
    pub saved: bool,
    /// Runs at power up.
    pub autorun: bool,
    /// Source was converted to byte code.
    pub byte_code: bool,
}

#[derive(Debug)]
struct ReplyRule {
    pattern: String,
    lines: Vec<String>,
    once: bool,
}

#[derive(Debug)]
struct MockState {
    controller: u32,
    identity: String,
    node_models: BTreeMap<u32, String>,
    globals: HashSet<(u32, String)>,
    scripts: HashMap<(u32, String), MockScript>,
    loading: Option<(String, Vec<String>)>,
    output: VecDeque<String>,
    writes: Vec<String>,
    errors: VecDeque<(i32, String)>,
    show_errors: bool,
    prompts: bool,
    ese: u8,
    sre: u8,
    event_register: u8,
    hold_completion: bool,
    data_queues: HashMap<u32, VecDeque<String>>,
    failures: Vec<String>,
    transport_failures: Vec<String>,
    rules: Vec<ReplyRule>,
    register_short_names: bool,
    resets: usize,
}

impl Default for MockState {
    fn default() -> Self {
        let mut node_models = BTreeMap::new();
        node_models.insert(1, "2612B".to_string());
        Self {
            controller: 1,
            identity: "Keithley Instruments Inc., Model 2612B, 4404545, 3.3.5".to_string(),
            node_models,
            globals: HashSet::new(),
            scripts: HashMap::new(),
            loading: None,
            output: VecDeque::new(),
            writes: Vec::new(),
            errors: VecDeque::new(),
            show_errors: false,
            prompts: false,
            ese: 0,
            sre: 0,
            event_register: 0,
            hold_completion: false,
            data_queues: HashMap::new(),
            failures: Vec::new(),
            transport_failures: Vec::new(),
            rules: Vec::new(),
            register_short_names: true,
            resets: 0,
        }
    }
}

/// Simulated TSP instrument group.
#[derive(Clone, Default)]
pub struct MockInstrument {
    inner: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockInstrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("MockInstrument")
            .field("controller", &state.controller)
            .field("writes", &state.writes.len())
            .finish()
    }
}

impl MockInstrument {
    /// Creates a single 2612B controller on node 1.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Controller node number.
    pub fn controller(&self) -> u32 {
        self.state().controller
    }

    /// Replaces the `*IDN?` reply.
    pub fn set_identity(&self, identity: &str) {
        self.state().identity = identity.to_string();
    }

    /// Adds a remote node with the given model.
    pub fn add_node(&self, node: u32, model: &str) {
        self.state().node_models.insert(node, model.to_string());
    }

    /// Defines a global on a node.
    pub fn define(&self, node: u32, name: &str) {
        self.state().globals.insert((node, name.to_string()));
    }

    /// Removes a global from a node.
    pub fn undefine(&self, node: u32, name: &str) {
        self.state().globals.remove(&(node, name.to_string()));
    }

    /// True when a global is defined on a node.
    pub fn is_defined(&self, node: u32, name: &str) -> bool {
        self.state().globals.contains(&(node, name.to_string()))
    }

    /// Installs a resident user script, as if loaded earlier.
    pub fn add_script(&self, node: u32, name: &str, body: &[&str], saved: bool) {
        let mut state = self.state();
        state.scripts.insert(
            (node, name.to_string()),
            MockScript {
                body: body.iter().map(ToString::to_string).collect(),
                saved,
                ..MockScript::default()
            },
        );
        state.globals.insert((node, name.to_string()));
        state
            .globals
            .insert((node, syntax::user_script_long_name(name)));
    }

    /// Snapshot of a user script on a node.
    pub fn script(&self, node: u32, name: &str) -> Option<MockScript> {
        self.state().scripts.get(&(node, name.to_string())).cloned()
    }

    /// Queues a device error.
    pub fn push_error(&self, code: i32, message: &str) {
        self.state().errors.push_back((code, message.to_string()));
    }

    /// Any written line containing `pattern` raises a device syntax error.
    pub fn fail_on(&self, pattern: &str) {
        self.state().failures.push(pattern.to_string());
    }

    /// Any written line containing `pattern` fails at the transport level.
    pub fn fail_transport_on(&self, pattern: &str) {
        self.state().transport_failures.push(pattern.to_string());
    }

    /// Commands containing `pattern` are answered with `lines`.
    pub fn reply_to(&self, pattern: &str, lines: &[&str]) {
        self.add_rule(pattern, lines, false);
    }

    /// The next command containing `pattern` is answered with `lines`.
    pub fn reply_once(&self, pattern: &str, lines: &[&str]) {
        self.add_rule(pattern, lines, true);
    }

    fn add_rule(&self, pattern: &str, lines: &[&str], once: bool) {
        self.state().rules.push(ReplyRule {
            pattern: pattern.to_string(),
            lines: lines.iter().map(ToString::to_string).collect(),
            once,
        });
    }

    /// While held, `*OPC` never completes and completion sentinels are not printed.
    pub fn hold_operation_completion(&self, hold: bool) {
        self.state().hold_completion = hold;
    }

    /// Sets the simulated `localnode.prompts`.
    pub fn set_prompts(&self, on: bool) {
        self.state().prompts = on;
    }

    /// Sets the simulated `localnode.showerrors`.
    pub fn set_show_errors(&self, on: bool) {
        self.state().show_errors = on;
    }

    /// When false, transferred scripts are only reachable by their long name.
    pub fn register_short_names(&self, on: bool) {
        self.state().register_short_names = on;
    }

    /// Every line written so far.
    pub fn writes(&self) -> Vec<String> {
        self.state().writes.clone()
    }

    /// Forgets the write log.
    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }

    /// Items waiting in a node data queue.
    pub fn data_queue_len(&self, node: u32) -> usize {
        self.state().data_queues.get(&node).map_or(0, VecDeque::len)
    }

    /// Pushes an item onto a node data queue.
    pub fn push_data_queue(&self, node: u32, item: &str) {
        self.state()
            .data_queues
            .entry(node)
            .or_default()
            .push_back(item.to_string());
    }

    /// Number of `localnode.reset()` calls seen.
    pub fn resets(&self) -> usize {
        self.state().resets
    }

    /// Pending output lines.
    pub fn pending_output(&self) -> usize {
        self.state().output.len()
    }
}

impl MockState {
    fn status_byte(&self) -> u8 {
        let mut status = 0;
        if !self.errors.is_empty() {
            status |= super::status_byte::ERROR_AVAILABLE;
        }
        if !self.output.is_empty() {
            status |= super::status_byte::MESSAGE_AVAILABLE;
        }
        if self.event_register & self.ese != 0 {
            status |= super::status_byte::EVENT_SUMMARY;
        }
        if status & self.sre != 0 {
            status |= super::status_byte::REQUESTING_SERVICE;
        }
        status
    }

    fn print(&mut self, line: impl Into<String>) {
        self.output.push_back(line.into());
    }

    fn prompt(&mut self, prompt: &str) {
        if self.prompts {
            self.print(prompt);
        }
    }

    fn raise(&mut self, code: i32, message: String) {
        let node = self.controller;
        if self.show_errors {
            self.print(format!("{code}\t{message}\t2\t{node}"));
        }
        self.errors.push_back((code, message));
    }

    fn define(&mut self, node: u32, name: &str) {
        self.globals.insert((node, name.to_string()));
    }

    fn is_defined(&self, node: u32, name: &str) -> bool {
        self.globals.contains(&(node, name.to_string()))
    }

    fn create_script(&mut self, node: u32, name: &str, body: Vec<String>, short_name: bool) {
        self.scripts.insert(
            (node, name.to_string()),
            MockScript {
                body,
                ..MockScript::default()
            },
        );
        if short_name {
            self.define(node, name);
        }
        self.define(node, &syntax::user_script_long_name(name));
    }

    fn handle_line(&mut self, line: &str) {
        let trimmed = line.trim();

        if let Some((name, mut body)) = self.loading.take() {
            if let Some(rest) = trimmed.strip_prefix("endscript") {
                let controller = self.controller;
                self.create_script(controller, &name, body, true);
                let rest = rest.trim();
                if rest.is_empty() {
                    self.prompt(syntax::PROMPT_READY);
                } else {
                    self.handle_command(rest);
                }
                return;
            }
            if self.failures.iter().any(|f| trimmed.contains(f.as_str())) {
                // A rejected line aborts the pending script.
                self.raise(
                    SYNTAX_ERROR_CODE,
                    format!("TSP Syntax error at line {}: unexpected symbol", body.len() + 1),
                );
                self.prompt(syntax::PROMPT_ERROR);
                return;
            }
            body.push(line.trim_end().to_string());
            self.loading = Some((name, body));
            self.prompt(syntax::PROMPT_CONTINUATION);
            return;
        }

        if self.failures.iter().any(|f| trimmed.contains(f.as_str())) {
            self.raise(SYNTAX_ERROR_CODE, format!("TSP Syntax error near '{trimmed}'"));
            self.prompt(syntax::PROMPT_ERROR);
            return;
        }

        self.handle_command(trimmed);
    }

    fn apply_rule(&mut self, command: &str) -> bool {
        let Some(index) = self
            .rules
            .iter()
            .rposition(|r| command.contains(r.pattern.as_str()))
        else {
            return false;
        };
        let lines = if self.rules[index].once {
            self.rules.remove(index).lines
        } else {
            self.rules[index].lines.clone()
        };
        for line in lines {
            self.print(line);
        }
        true
    }

    fn handle_command(&mut self, command: &str) {
        if self.apply_rule(command) {
            self.prompt(syntax::PROMPT_READY);
            return;
        }

        if let Some(c) = LOADSCRIPT.captures(command) {
            self.loading = Some((c[1].to_string(), Vec::new()));
            self.prompt(syntax::PROMPT_CONTINUATION);
            return;
        }

        let (body, wants_completion) = match command.strip_suffix(syntax::TSP_OPERATION_COMPLETED_QUERY)
        {
            Some(body) => (body.trim(), true),
            None => (command, false),
        };

        let errors_before = self.errors.len();
        self.execute(body);

        if wants_completion && !self.hold_completion && self.errors.len() == errors_before {
            self.print(syntax::OPERATION_COMPLETED_VALUE);
        }
        if self.errors.len() > errors_before {
            self.prompt(syntax::PROMPT_ERROR);
        } else {
            self.prompt(syntax::PROMPT_READY);
        }
    }

    fn nil_index(&mut self, name: &str) {
        self.raise(
            RUNTIME_ERROR_CODE,
            format!("TSP Runtime error: attempt to index global '{name}' (a nil value)"),
        );
    }

    fn execute(&mut self, body: &str) {
        let controller = self.controller;
        match body {
            "" => return,
            syntax::OPERATION_COMPLETED_QUERY => {
                if !self.hold_completion {
                    self.print(syntax::OPERATION_COMPLETED_VALUE);
                }
                return;
            }
            syntax::OPERATION_COMPLETE_COMMAND => {
                if !self.hold_completion {
                    self.event_register |= 0x01;
                }
                return;
            }
            syntax::STANDARD_EVENT_STATUS_QUERY => {
                let value = self.event_register;
                self.event_register = 0;
                self.print(value.to_string());
                return;
            }
            syntax::STATUS_BYTE_QUERY => {
                let status = self.status_byte();
                self.print(status.to_string());
                return;
            }
            syntax::IDENTITY_QUERY => {
                let identity = self.identity.clone();
                self.print(identity);
                return;
            }
            "*CLS" => {
                self.errors.clear();
                self.event_register = 0;
                return;
            }
            syntax::ERROR_QUEUE_COUNT_QUERY => {
                let count = self.errors.len();
                self.print(count.to_string());
                return;
            }
            syntax::ERROR_QUEUE_NEXT_QUERY => {
                let entry = match self.errors.pop_front() {
                    Some((code, message)) => format!("{code}\t{message}\t2\t{controller}"),
                    None => "0\tQueue Is Empty\t0\t0".to_string(),
                };
                self.print(entry);
                return;
            }
            syntax::ERROR_QUEUE_CLEAR_COMMAND => {
                self.errors.clear();
                return;
            }
            syntax::SHOW_ERRORS_QUERY => {
                let value = u8::from(self.show_errors);
                self.print(value.to_string());
                return;
            }
            syntax::SHOW_PROMPTS_QUERY => {
                let value = u8::from(self.prompts);
                self.print(value.to_string());
                return;
            }
            syntax::CONTROLLER_NODE_QUERY => {
                self.print(controller.to_string());
                return;
            }
            syntax::NODE_MODELS_QUERY => {
                let list: String = self
                    .node_models
                    .iter()
                    .map(|(n, m)| format!("{n}={m},"))
                    .collect();
                self.print(list);
                return;
            }
            syntax::CATALOG_QUERY => {
                let list = self.catalog(controller);
                self.print(list);
                return;
            }
            syntax::LOCAL_NODE_RESET_COMMAND => {
                self.resets += 1;
                return;
            }
            syntax::WAIT_COMPLETE_ALL_COMMAND => return,
            _ => {}
        }

        if body.starts_with("display.") {
            return;
        }

        if let Some(c) = SHOW_ERRORS_SET.captures(body) {
            self.show_errors = &c[1] != "0";
        } else if let Some(c) = PROMPTS_SET.captures(body) {
            self.prompts = &c[1] != "0";
        } else if let Some(c) = ESE_SET.captures(body) {
            self.ese = c[1].parse().unwrap_or(0);
        } else if let Some(c) = SRE_SET.captures(body) {
            self.sre = c[1].parse().unwrap_or(0);
        } else if let Some(c) = IS_NIL_GETGLOBAL
            .captures(body)
            .or_else(|| IS_NIL_NODE.captures(body))
        {
            let node = c[1].parse().unwrap_or(0);
            let nil = !self.is_defined(node, &c[2]);
            self.print(nil.to_string());
        } else if let Some(c) = IS_NIL.captures(body) {
            let nil = !self.is_defined(controller, &c[1]);
            self.print(nil.to_string());
        } else if let Some(c) = PRINT_SOURCE.captures(body) {
            match self.scripts.get(&(controller, c[1].to_string())).cloned() {
                Some(script) if !script.byte_code => {
                    self.print(script.body.len().to_string());
                    for line in script.body {
                        self.print(line);
                    }
                }
                _ => self.nil_index(&format!("{}.source", &c[1])),
            }
        } else if let Some(c) = DATA_QUEUE_COUNT.captures(body) {
            let node = c[1].parse().unwrap_or(0);
            let count = self.data_queues.get(&node).map_or(0, VecDeque::len);
            self.print(count.to_string());
        } else if let Some(c) = DATA_QUEUE_CLEAR.captures(body) {
            let node = c[1].parse().unwrap_or(0);
            self.data_queues.remove(&node);
        } else if let Some(c) = DATA_QUEUE_ADD_SOURCE.captures(body) {
            let node = c[1].parse().unwrap_or(0);
            match self.scripts.get(&(controller, c[2].to_string())) {
                Some(script) if self.is_defined(controller, &c[2]) && !script.byte_code => {
                    let source = script.body.join("\n");
                    self.data_queues.entry(node).or_default().push_back(source);
                }
                _ => self.nil_index(&c[2]),
            }
        } else if let Some(c) = SCRIPT_NEW_FROM_QUEUE.captures(body) {
            let node = c[1].parse().unwrap_or(0);
            match self.data_queues.get_mut(&node).and_then(VecDeque::pop_front) {
                Some(source) => {
                    let body = source.lines().map(ToString::to_string).collect();
                    let short = self.register_short_names;
                    self.create_script(node, &c[3], body, short);
                }
                None => self.nil_index("dataqueue.next()"),
            }
        } else if let Some(c) = CATALOG_ON_NODE.captures(body) {
            let node = c[1].parse().unwrap_or(0);
            let list = self.catalog(node);
            self.print(list);
        } else if let Some(c) = ALIAS_ON_NODE.captures(body) {
            let node = c[1].parse().unwrap_or(0);
            self.alias(node, &c[2], &c[3]);
        } else if let Some(c) = ALIAS.captures(body) {
            self.alias(controller, &c[1], &c[2]);
        } else if let Some(c) = NIL_ON_NODE.captures(body) {
            let node = c[1].parse().unwrap_or(0);
            self.globals.remove(&(node, c[2].to_string()));
        } else if let Some(c) = NIL.captures(body) {
            self.globals.remove(&(controller, c[1].to_string()));
        } else if let Some(c) = RUN.captures(body) {
            self.run(&c[1]);
        } else if let Some(c) = UPLOAD_HELPER.captures(body) {
            let node = c[2].parse().unwrap_or(0);
            if !self.is_defined(controller, &c[1]) {
                self.nil_index(&c[1]);
            } else if let Some(script) = self.scripts.get(&(controller, c[3].to_string())).cloned() {
                let short = self.register_short_names;
                self.create_script(node, &c[3], script.body, short);
            } else {
                self.nil_index(&c[3]);
            }
        } else if let Some(c) = SAVE_ON_NODE.captures(body) {
            let node = c[1].parse().unwrap_or(0);
            self.save(node, &c[3], c.get(2).is_some());
        } else if let Some(c) = SAVE.captures(body) {
            self.save(controller, &c[2], c.get(1).is_some());
        } else if let Some(c) = NIL_SOURCE.captures(body) {
            self.convert(controller, &c[1]);
        } else if let Some(c) = NIL_SOURCE_ON_NODE.captures(body) {
            let node = c[1].parse().unwrap_or(0);
            self.convert(node, &c[2]);
        } else if RESET_ON_NODE.is_match(body) {
            self.resets += 1;
        } else if let Some(c) = CONVERT_WITH_FUNCTION.captures(body) {
            if self.is_defined(controller, &c[1]) {
                self.convert(controller, &c[2]);
            } else {
                self.nil_index(&c[1]);
            }
        }
    }

    fn catalog(&self, node: u32) -> String {
        let mut names: Vec<&str> = self
            .scripts
            .iter()
            .filter(|((n, _), s)| *n == node && s.saved)
            .map(|((_, name), _)| name.as_str())
            .collect();
        names.sort_unstable();
        names.iter().map(|n| format!("{n},")).collect()
    }

    fn alias(&mut self, node: u32, short: &str, long: &str) {
        if self.is_defined(node, &syntax::user_script_long_name(long)) {
            self.define(node, short);
        } else {
            self.nil_index(&syntax::user_script_long_name(long));
        }
    }

    fn save(&mut self, node: u32, name: &str, autorun: bool) {
        match self.scripts.get_mut(&(node, name.to_string())) {
            Some(script) => {
                script.saved = true;
                script.autorun |= autorun;
            }
            None => self.nil_index(name),
        }
    }

    fn convert(&mut self, node: u32, name: &str) {
        match self.scripts.get_mut(&(node, name.to_string())) {
            Some(script) => {
                script.byte_code = true;
                script.saved = false;
            }
            None => self.nil_index(name),
        }
    }

    fn run(&mut self, name: &str) {
        let controller = self.controller;
        let Some(script) = self.scripts.get(&(controller, name.to_string())).cloned() else {
            self.nil_index(name);
            return;
        };
        let mut transfer: Option<(u32, String, Vec<String>)> = None;
        for line in &script.body {
            if let Some((node, target, mut lines)) = transfer.take() {
                if LOADER_CLOSE.is_match(line.trim()) {
                    let short = self.register_short_names;
                    self.create_script(node, &target, lines, short);
                } else {
                    lines.push(line.clone());
                    transfer = Some((node, target, lines));
                }
                continue;
            }
            if let Some(c) = LOADER_OPEN.captures(line.trim()) {
                transfer = Some((c[1].parse().unwrap_or(0), c[2].to_string(), Vec::new()));
            } else if let Some(c) = NAMESPACE_DEFINITION.captures(line) {
                self.define(controller, &c[1]);
            } else if let Some(c) = FUNCTION_DEFINITION.captures(line) {
                self.define(controller, &c[1]);
            }
        }
    }
}

#[async_trait]
impl Transport for MockInstrument {
    async fn write_line(&mut self, line: &str) -> TspResult<()> {
        let mut state = self.state();
        state.writes.push(line.to_string());
        if state
            .transport_failures
            .iter()
            .any(|f| line.contains(f.as_str()))
        {
            return Err(TspError::Transport(format!("injected failure writing '{line}'")));
        }
        state.handle_line(line);
        Ok(())
    }

    async fn read_line(&mut self) -> TspResult<String> {
        self.state()
            .output
            .pop_front()
            .ok_or_else(|| TspError::Transport("read timed out: no data available".to_string()))
    }

    async fn read_status_byte(&mut self) -> TspResult<u8> {
        Ok(self.state().status_byte())
    }

    async fn discard_unread_data(&mut self, _timeout: Duration) -> TspResult<usize> {
        let mut state = self.state();
        let count = state.output.len();
        state.output.clear();
        Ok(count)
    }

    fn describe(&self) -> String {
        "simulator".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn send(mock: &mut MockInstrument, line: &str) -> Vec<String> {
        mock.write_line(line).await.unwrap();
        let mut replies = Vec::new();
        while let Ok(line) = mock.read_line().await {
            replies.push(line);
        }
        replies
    }

    #[tokio::test]
    async fn test_loadscript_creates_script() {
        let mut mock = MockInstrument::new();
        send(&mut mock, "loadscript foo ").await;
        send(&mut mock, "print(1) ").await;
        let replies = send(&mut mock, &syntax::end_script_command()).await;
        assert_eq!(replies, vec!["1"]);
        assert!(mock.is_defined(1, "foo"));
        assert!(mock.is_defined(1, "script.user.scripts.foo"));
        assert_eq!(mock.script(1, "foo").unwrap().body, vec!["print(1)"]);
    }

    #[tokio::test]
    async fn test_failure_injection_aborts_load() {
        let mut mock = MockInstrument::new();
        mock.fail_on("boom");
        send(&mut mock, "loadscript foo ").await;
        send(&mut mock, "boom() ").await;
        assert_eq!(mock.read_status_byte().await.unwrap() & 0x04, 0x04);
        assert!(mock.script(1, "foo").is_none());
    }

    #[tokio::test]
    async fn test_prompts_follow_each_line() {
        let mut mock = MockInstrument::new();
        mock.set_prompts(true);
        assert_eq!(send(&mut mock, "loadscript foo ").await, vec![">>>>"]);
        assert_eq!(send(&mut mock, "x=1 ").await, vec![">>>>"]);
        assert_eq!(send(&mut mock, "endscript").await, vec!["TSP>"]);
    }

    #[tokio::test]
    async fn test_run_defines_namespace() {
        let mut mock = MockInstrument::new();
        mock.add_script(1, "support", &["isr = {}", "function isr.hello() end"], false);
        send(&mut mock, &syntax::run_script_command("support")).await;
        assert!(mock.is_defined(1, "isr"));
        assert!(mock.is_defined(1, "isr.hello"));
    }

    #[tokio::test]
    async fn test_data_queue_transfer() {
        let mut mock = MockInstrument::new();
        mock.add_node(3, "2612B");
        mock.add_script(1, "bar", &["x=1"], false);
        send(&mut mock, &syntax::data_queue_add_source_command(3, "bar")).await;
        assert_eq!(mock.data_queue_len(3), 1);
        send(&mut mock, &syntax::script_new_from_data_queue_command(3, "bar")).await;
        assert!(mock.is_defined(3, "bar"));
        assert_eq!(mock.data_queue_len(3), 0);
    }

    #[tokio::test]
    async fn test_save_and_catalog() {
        let mut mock = MockInstrument::new();
        mock.add_script(1, "a", &["x=1"], false);
        mock.add_script(1, "b", &["x=2"], false);
        send(&mut mock, &syntax::save_command("b", false)).await;
        assert_eq!(send(&mut mock, syntax::CATALOG_QUERY).await, vec!["b,"]);
        send(&mut mock, &syntax::save_command("a", true)).await;
        assert_eq!(send(&mut mock, syntax::CATALOG_QUERY).await, vec!["a,b,"]);
        assert!(mock.script(1, "a").unwrap().autorun);
    }

    #[tokio::test]
    async fn test_reply_rules() {
        let mut mock = MockInstrument::new();
        mock.reply_once("custom", &["42"]);
        assert_eq!(send(&mut mock, "print(custom)").await, vec!["42"]);
        assert!(send(&mut mock, "print(custom)").await.is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_injection() {
        let mut mock = MockInstrument::new();
        mock.fail_transport_on("explode");
        assert!(mock.write_line("explode()").await.is_err());
        assert_eq!(mock.writes(), vec!["explode()"]);
    }
}
