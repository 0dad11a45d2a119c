//! Script runtime selection
//!
//! The embedded interpreter is linked through the `script-host`
//! capability contract (`ScriptRuntime`); this daemon does not bundle
//! one. Builds that embed an interpreter replace [`make_runtime`] with
//! their binding; the stock binary reports the missing runtime as a
//! fatal library-load error at engine init.

use cell_model::Value;
use script_host::runtime::{
    EvalError, Frame, HostApi, RuntimeError, ScriptRuntime, ThreadRef,
};
use std::path::Path;
use std::rc::Rc;

struct UnboundRuntime;

impl ScriptRuntime for UnboundRuntime {
    fn bind(&self, _host: Rc<dyn HostApi>) -> Result<(), RuntimeError> {
        Err(RuntimeError::LibraryInit(
            "this build does not embed a script runtime; \
             link an interpreter through the script-host contract"
                .to_string(),
        ))
    }

    fn spawn_thread(&self, _script: &Path) -> Result<ThreadRef, RuntimeError> {
        Err(RuntimeError::Internal("no script runtime".to_string()))
    }

    fn drop_thread(&self, _thread: ThreadRef) {}

    fn eval_file(&self, _thread: ThreadRef, path: &Path) -> Result<(), EvalError> {
        Err(EvalError {
            message: "no script runtime".to_string(),
            traceback: vec![Frame {
                file: path.to_path_buf(),
                line: 0,
            }],
        })
    }

    fn eval(&self, _code: &str) -> Result<Value, EvalError> {
        Err(EvalError {
            message: "no script runtime".to_string(),
            traceback: Vec::new(),
        })
    }

    fn call(&self, _func: u64, _args: &[Value]) -> Result<Value, EvalError> {
        Err(EvalError {
            message: "no script runtime".to_string(),
            traceback: Vec::new(),
        })
    }

    fn release(&self, _func: u64) {}
}

/// The runtime this build wires into the engine.
#[must_use]
pub fn make_runtime() -> Rc<dyn ScriptRuntime> {
    Rc::new(UnboundRuntime)
}
