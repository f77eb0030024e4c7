//! Lua sandbox creation
//!
//! Pipeline definitions are evaluated in a restricted Lua state that has no
//! filesystem, network or process access. Definitions only describe stages;
//! nothing in the sandbox executes commands.
//!
//! Three helper tables are always injected:
//! - `pipeline`: `define`, `input`, `stage` (pass-through constructors)
//! - `step`: one constructor per step kind, each tagging the table with `kind`
//! - `when`: guard constructors (`param`, `equals`, `negate`, `all`, `any`)

use mlua::{Function, Lua, LuaOptions, Result as LuaResult, StdLib, Table};

/// Step kinds understood by the parser
pub const STEP_KINDS: [&str; 7] = [
    "exec",
    "container_build",
    "container_push",
    "container_run",
    "deploy",
    "archive",
    "clean_workspace",
];

/// Create a restricted Lua sandbox
///
/// This sandbox includes only basic Lua functionality (tables, strings, math)
/// and does NOT include any I/O capabilities or the ability to load external code.
///
/// # Example
/// ```no_run
/// use conveyor_lua::sandbox::create_sandbox;
///
/// let lua = create_sandbox()?;
/// let definition: mlua::Table = lua
///     .load(r#"return pipeline.define { name = "app", stages = {} }"#)
///     .eval()?;
/// let name: String = definition.get("name")?;
/// assert_eq!(name, "app");
/// # Ok::<(), mlua::Error>(())
/// ```
pub fn create_sandbox() -> LuaResult<Lua> {
    // Only allow: TABLE, STRING, MATH
    // Explicitly exclude: IO, OS, PACKAGE, DEBUG, COROUTINE
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH,
        LuaOptions::default(),
    )?;

    // Remove globals that can load code from disk
    lua.globals().set("require", mlua::Nil)?;
    lua.globals().set("dofile", mlua::Nil)?;
    lua.globals().set("loadfile", mlua::Nil)?;

    register_pipeline_module(&lua)?;
    register_step_module(&lua)?;
    register_when_module(&lua)?;

    Ok(lua)
}

/// Register the pipeline module
///
/// `pipeline.define`, `pipeline.input` and `pipeline.stage` return their
/// argument unchanged; they exist so definitions read declaratively.
fn register_pipeline_module(lua: &Lua) -> LuaResult<()> {
    let pipeline = lua.create_table()?;

    for name in ["define", "input", "stage"] {
        let passthrough = lua.create_function(|_, table: Table| Ok(table))?;
        pipeline.set(name, passthrough)?;
    }

    lua.globals().set("pipeline", pipeline)?;
    Ok(())
}

/// Register the step module
///
/// `step.exec { cmd = "make", args = { "build" } }` is the same as writing
/// `{ kind = "exec", cmd = "make", args = { "build" } }`.
fn register_step_module(lua: &Lua) -> LuaResult<()> {
    let step = lua.create_table()?;

    for kind in STEP_KINDS {
        step.set(kind, kind_constructor(lua, kind)?)?;
    }

    lua.globals().set("step", step)?;
    Ok(())
}

fn kind_constructor(lua: &Lua, kind: &'static str) -> LuaResult<Function> {
    lua.create_function(move |lua, spec: Option<Table>| {
        let table = match spec {
            Some(table) => table,
            None => lua.create_table()?,
        };
        table.set("kind", kind)?;
        Ok(table)
    })
}

/// Register the when module (stage guards)
fn register_when_module(lua: &Lua) -> LuaResult<()> {
    let when = lua.create_table()?;

    // when.param(name) - true when the parameter is true
    when.set(
        "param",
        lua.create_function(|lua, name: String| {
            let guard = lua.create_table()?;
            guard.set("param", name)?;
            Ok(guard)
        })?,
    )?;

    // when.equals(name, value) - true when the parameter equals value
    when.set(
        "equals",
        lua.create_function(|lua, (name, value): (String, mlua::Value)| {
            let guard = lua.create_table()?;
            guard.set("param", name)?;
            guard.set("equals", value)?;
            Ok(guard)
        })?,
    )?;

    // when.negate(guard)
    when.set(
        "negate",
        lua.create_function(|lua, inner: Table| {
            let guard = lua.create_table()?;
            guard.set("not", inner)?;
            Ok(guard)
        })?,
    )?;

    // when.all { ... } / when.any { ... }
    for combinator in ["all", "any"] {
        when.set(
            combinator,
            lua.create_function(move |lua, guards: Table| {
                let guard = lua.create_table()?;
                guard.set(combinator, guards)?;
                Ok(guard)
            })?,
        )?;
    }

    lua.globals().set("when", when)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_basic_lua() {
        let lua = create_sandbox().unwrap();

        let result: i32 = lua
            .load(
                r#"
                local t = {a = 1, b = 2}
                return t.a + t.b
            "#,
            )
            .eval()
            .unwrap();
        assert_eq!(result, 3);

        let result: String = lua.load(r#"return string.upper("hello")"#).eval().unwrap();
        assert_eq!(result, "HELLO");
    }

    #[test]
    fn test_sandbox_no_io() {
        let lua = create_sandbox().unwrap();

        let has_io: bool = lua.load(r#"return io ~= nil"#).eval().unwrap();
        assert!(!has_io);

        let has_os: bool = lua.load(r#"return os ~= nil"#).eval().unwrap();
        assert!(!has_os);
    }

    #[test]
    fn test_sandbox_no_require() {
        let lua = create_sandbox().unwrap();

        let result: LuaResult<()> = lua.load(r#"require("os")"#).exec();
        assert!(result.is_err());

        let result: LuaResult<()> = lua.load(r#"dofile("/etc/passwd")"#).exec();
        assert!(result.is_err());
    }

    #[test]
    fn test_step_constructors_tag_kind() {
        let lua = create_sandbox().unwrap();

        let kind: String = lua
            .load(r#"return step.exec { cmd = "make" }.kind"#)
            .eval()
            .unwrap();
        assert_eq!(kind, "exec");

        let kind: String = lua
            .load(r#"return step.clean_workspace().kind"#)
            .eval()
            .unwrap();
        assert_eq!(kind, "clean_workspace");
    }

    #[test]
    fn test_when_constructors() {
        let lua = create_sandbox().unwrap();

        let (param, equals): (String, String) = lua
            .load(
                r#"
                local g = when.equals("ENVIRONMENT", "production")
                return g.param, g.equals
            "#,
            )
            .eval()
            .unwrap();
        assert_eq!(param, "ENVIRONMENT");
        assert_eq!(equals, "production");

        let inner: String = lua
            .load(r#"return when.negate(when.param("DEPLOY"))["not"].param"#)
            .eval()
            .unwrap();
        assert_eq!(inner, "DEPLOY");
    }
}
