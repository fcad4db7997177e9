//! TSP command vocabulary.
//!
//! Every command string the protocols put on the wire is built here so the
//! simulator and the protocol code agree on a single spelling.

/// Reply to an operation-completed query.
pub const OPERATION_COMPLETED_VALUE: &str = "1";

/// IEEE 488.2 operation-completed query.
pub const OPERATION_COMPLETED_QUERY: &str = "*OPC?";

/// IEEE 488.2 operation-complete command (sets the OPC event when done).
pub const OPERATION_COMPLETE_COMMAND: &str = "*OPC";

/// TSP form of `*OPC?`, appendable to a compound command line.
pub const TSP_OPERATION_COMPLETED_QUERY: &str = "_G.waitcomplete() _G.print('1')";

/// Reads and clears the standard event status register.
pub const STANDARD_EVENT_STATUS_QUERY: &str = "*ESR?";

/// Status byte query for transports without an out-of-band read.
pub const STATUS_BYTE_QUERY: &str = "*STB?";

/// Identity query.
pub const IDENTITY_QUERY: &str = "*IDN?";

/// Enables the OPC bit in the standard event enable register.
pub const STANDARD_EVENT_ENABLE_OPC: &str = "*ESE 1";

/// Enables service requests on the event summary bit.
pub const SERVICE_REQUEST_ENABLE_ESB: &str = "*SRE 32";

/// Error queue count query.
pub const ERROR_QUEUE_COUNT_QUERY: &str = "_G.print(_G.errorqueue.count)";

/// Error queue next-entry query.
pub const ERROR_QUEUE_NEXT_QUERY: &str = "_G.print(_G.errorqueue.next())";

/// Clears the error queue.
pub const ERROR_QUEUE_CLEAR_COMMAND: &str = "_G.errorqueue.clear() _G.waitcomplete()";

/// Reads the show-errors setting.
pub const SHOW_ERRORS_QUERY: &str = "_G.print(localnode.showerrors)";

/// Reads the prompts setting.
pub const SHOW_PROMPTS_QUERY: &str = "_G.print(localnode.prompts)";

/// Controller node number query.
pub const CONTROLLER_NODE_QUERY: &str = "_G.print(tsplink.node)";

/// Lists `number=model,` for every populated TSP-Link node.
pub const NODE_MODELS_QUERY: &str =
    "do local s='' for i=1,64 do if node[i]~=nil then s=s..i..'='..node[i].model..',' end end print(s) end";

/// Resets the local node.
pub const LOCAL_NODE_RESET_COMMAND: &str = "localnode.reset() _G.waitcomplete()";

/// Prompt printed when the instrument is idle and ready.
pub const PROMPT_READY: &str = "TSP>";

/// Prompt printed while a multi-line chunk is being accepted.
pub const PROMPT_CONTINUATION: &str = ">>>>";

/// Prompt printed after an error.
pub const PROMPT_ERROR: &str = "TSP?";

/// Sets `localnode.showerrors`.
pub fn show_errors_command(on: bool) -> String {
    format!("localnode.showerrors={}", u8::from(on))
}

/// Sets `localnode.prompts`.
pub fn show_prompts_command(on: bool) -> String {
    format!("localnode.prompts={}", u8::from(on))
}

/// Opens a script body. The trailing space is part of the device convention.
pub fn load_script_command(name: &str) -> String {
    format!("loadscript {name} ")
}

/// Closes a script body and asks for completion.
pub fn end_script_command() -> String {
    format!("endscript {TSP_OPERATION_COMPLETED_QUERY}")
}

/// Prints whether a global on the controller is nil.
pub fn is_nil_query(name: &str) -> String {
    format!("_G.print({name}==nil)")
}

/// Prints whether a global on a remote node is nil.
///
/// Plain names go through `getglobal`; dotted names are resolved through the
/// node table.
pub fn is_nil_on_node_query(node: u32, name: &str) -> String {
    if name.contains('.') {
        format!("_G.print(node[{node}].{name}==nil)")
    } else {
        format!("_G.print(node[{node}].getglobal('{name}')==nil)")
    }
}

/// Wraps `chunk` so it runs on `node`, waiting for that node to finish.
pub fn execute_on_node(node: u32, chunk: &str) -> String {
    format!("node[{node}].execute('{chunk}') waitcomplete({node})")
}

/// Assigns nil to an object on the controller.
pub fn nil_command(name: &str) -> String {
    format!("{name} = nil {TSP_OPERATION_COMPLETED_QUERY} ")
}

/// Assigns nil to an object on a remote node.
pub fn nil_on_node_command(node: u32, name: &str) -> String {
    format!(
        "{} {TSP_OPERATION_COMPLETED_QUERY} ",
        execute_on_node(node, &format!("{name}=nil"))
    )
}

/// Runs a script.
pub fn run_script_command(name: &str) -> String {
    format!("{name}.run() _G.waitcomplete()")
}

/// Long name under which every named script is reachable.
pub fn user_script_long_name(name: &str) -> String {
    format!("script.user.scripts.{name}")
}

/// Re-binds the short name to the script found under its long name.
pub fn alias_command(name: &str) -> String {
    format!("{name} = {} waitcomplete()", user_script_long_name(name))
}

/// Re-binds the short name on a remote node.
pub fn alias_on_node_command(node: u32, name: &str) -> String {
    execute_on_node(
        node,
        &format!("{name}={} waitcomplete()", user_script_long_name(name)),
    )
}

/// Clears a node data queue.
pub fn data_queue_clear_command(node: u32) -> String {
    format!("node[{node}].dataqueue.clear() waitcomplete({node})")
}

/// Data queue item count on a node.
pub fn data_queue_count_query(node: u32) -> String {
    format!("_G.print(node[{node}].dataqueue.count)")
}

/// Pushes a controller script source onto a node data queue.
pub fn data_queue_add_source_command(node: u32, name: &str) -> String {
    format!("node[{node}].dataqueue.add({name}.source) waitcomplete()")
}

/// Rebuilds a script on a remote node from its data queue.
pub fn script_new_from_data_queue_command(node: u32, name: &str) -> String {
    format!(
        "node[{node}].execute('waitcomplete() {name}=script.new(dataqueue.next(),[[{name}]])')"
    )
}

/// Waits for the whole TSP-Link group to finish.
pub const WAIT_COMPLETE_ALL_COMMAND: &str = "waitcomplete(0)";

/// Delegates a copy to the resident upload helper.
pub fn upload_helper_command(helper: &str, node: u32, name: &str) -> String {
    format!("{helper}(node[{node}],{name}) waitcomplete(0)")
}

/// Name of the temporary loader used for binary transfers.
pub fn loader_script_name(name: &str) -> String {
    format!("_{name}_loader")
}

/// Builds the binary loader payload.
///
/// The loader runs on the controller and rebuilds `name` on `node` from the
/// embedded byte code.
pub fn binary_loader_lines(node: u32, name: &str, byte_code: &[String]) -> Vec<String> {
    let mut lines = Vec::with_capacity(byte_code.len() + 4);
    lines.push(load_script_command(&loader_script_name(name)));
    lines.push(format!("node[{node}].execute([==[{name}=script.new([=["));
    lines.extend(byte_code.iter().cloned());
    lines.push(format!("]=],'{name}')]==]) waitcomplete({node})"));
    lines.push("endscript".to_string());
    lines
}

/// Saves a script to non-volatile memory.
pub fn save_command(name: &str, autorun: bool) -> String {
    if autorun {
        format!("{name}.autorun='yes' {name}.save() {TSP_OPERATION_COMPLETED_QUERY}")
    } else {
        format!("{name}.save() {TSP_OPERATION_COMPLETED_QUERY}")
    }
}

/// Saves a script on a remote node.
pub fn save_on_node_command(node: u32, name: &str, autorun: bool) -> String {
    let chunk = if autorun {
        format!("{name}.autorun=\"yes\" {name}.save()")
    } else {
        format!("{name}.save()")
    };
    format!("{} {TSP_OPERATION_COMPLETED_QUERY}", execute_on_node(node, &chunk))
}

/// Resets a remote node.
pub fn reset_on_node_command(node: u32) -> String {
    execute_on_node(node, "localnode.reset()")
}

/// Converts a script to byte code in place by dropping its source.
pub fn nil_source_command(name: &str) -> String {
    format!("{name}.source=nil waitcomplete()")
}

/// Converts a script on a remote node to byte code in place.
pub fn nil_source_on_node_command(node: u32, name: &str) -> String {
    execute_on_node(node, &format!("{name}.source=nil"))
}

/// Prints the line count of a script source followed by the source itself.
pub fn print_source_command(name: &str) -> String {
    format!(
        "do local n=0 for l in string.gmatch({name}.source..'\\n','(.-)\\n') do n=n+1 end print(n) print({name}.source) end"
    )
}

/// Calls an explicit byte code converter function.
pub fn convert_with_function_command(function: &str, name: &str) -> String {
    format!("{function}({name}) waitcomplete()")
}

/// Prints the comma separated saved-script catalog of the controller.
pub const CATALOG_QUERY: &str =
    "do local s='' for n in script.user.catalog() do s=s..n..',' end print(s) end";

/// Prints the saved-script catalog of a remote node through its data queue.
pub fn catalog_on_node_query(node: u32) -> String {
    format!(
        "node[{node}].execute(\"local s='' for n in script.user.catalog() do s=s..n..',' end dataqueue.add(s)\") waitcomplete({node}) _G.print(node[{node}].dataqueue.next())"
    )
}

/// Writes a line to the front panel.
pub fn display_line_command(row: u8, text: &str) -> String {
    let text = text.replace('"', "'");
    format!("display.setcursor({row},1) display.settext(\"{text}\")")
}

/// Clears the front panel.
pub const DISPLAY_CLEAR_COMMAND: &str = "display.clear()";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_script_command_keeps_trailing_space() {
        assert_eq!(load_script_command("foo"), "loadscript foo ");
    }

    #[test]
    fn test_is_nil_on_node_forms() {
        assert_eq!(
            is_nil_on_node_query(2, "foo"),
            "_G.print(node[2].getglobal('foo')==nil)"
        );
        assert_eq!(
            is_nil_on_node_query(2, "script.user.scripts.foo"),
            "_G.print(node[2].script.user.scripts.foo==nil)"
        );
    }

    #[test]
    fn test_data_queue_commands() {
        assert_eq!(
            data_queue_add_source_command(3, "bar"),
            "node[3].dataqueue.add(bar.source) waitcomplete()"
        );
        assert_eq!(
            script_new_from_data_queue_command(3, "bar"),
            "node[3].execute('waitcomplete() bar=script.new(dataqueue.next(),[[bar]])')"
        );
        assert_eq!(
            data_queue_clear_command(3),
            "node[3].dataqueue.clear() waitcomplete(3)"
        );
    }

    #[test]
    fn test_binary_loader_frames_byte_code() {
        let lines = binary_loader_lines(3, "bar", &["loadstring('\\27LuaP')".to_string()]);
        assert_eq!(lines.first().unwrap(), "loadscript _bar_loader ");
        assert!(lines[1].starts_with("node[3].execute([==[bar=script.new([=["));
        assert_eq!(lines[2], "loadstring('\\27LuaP')");
        assert_eq!(lines.last().unwrap(), "endscript");
    }

    #[test]
    fn test_node_scoped_conversion() {
        assert_eq!(
            nil_source_on_node_command(2, "foo"),
            "node[2].execute('foo.source=nil') waitcomplete(2)"
        );
    }

    #[test]
    fn test_alias_command() {
        assert_eq!(
            alias_command("foo"),
            "foo = script.user.scripts.foo waitcomplete()"
        );
    }
}
