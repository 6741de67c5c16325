//! In-process programs used by the unit tests.

use crate::logs::Console;
use crate::runtime::lifecycle::RunScope;
use crate::runtime::program::{
    CompiledProgram, EntryPoint, ExecutedNode, ExecutionFlowReport, FlowInterpreter, NodeResult, ProgramError,
    RunContext,
};
use async_trait::async_trait;
use std::time::Duration;

/// Interpreter over a fixed, linear node list
pub(crate) struct ScriptedInterpreter {
    nodes: Vec<ExecutedNode>,
    delay: Duration,
}

impl ScriptedInterpreter {
    pub(crate) fn new(nodes: Vec<ExecutedNode>) -> Self {
        Self {
            nodes,
            delay: Duration::ZERO,
        }
    }

    /// Sleep before returning, to hold a run open
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl FlowInterpreter for ScriptedInterpreter {
    async fn execute_node(&self, entry_node: &str, ctx: &RunContext) -> Result<ExecutionFlowReport, ProgramError> {
        let visited: Vec<ExecutedNode> = match &ctx.scope {
            RunScope::SingleNode(id) => self.nodes.iter().filter(|n| &n.id == id).cloned().collect(),
            RunScope::FullGraph => self
                .nodes
                .iter()
                .skip_while(|n| n.id != entry_node)
                .cloned()
                .collect(),
        };

        for node in &visited {
            ctx.console.println(format!("executing {}", node.id));
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        Ok(ExecutionFlowReport {
            run_id: ctx.run_id.clone(),
            nodes_order: visited,
            is_schedule: false,
        })
    }

    async fn get_node_by_id(&self, node_id: &str) -> Option<NodeResult> {
        self.nodes.iter().find(|n| n.id == node_id).map(|n| NodeResult {
            id: n.id.clone(),
            node_type: n.node_type.clone(),
            data: n.variables.clone(),
        })
    }
}

/// Program with no entry functions, only module-level output
pub(crate) struct SideEffectProgram {
    version_id: String,
}

impl SideEffectProgram {
    pub(crate) fn new(version_id: &str) -> Self {
        Self {
            version_id: version_id.to_string(),
        }
    }
}

impl CompiledProgram for SideEffectProgram {
    fn version_id(&self) -> &str {
        &self.version_id
    }

    fn entry(&self, _name: &str) -> Option<EntryPoint> {
        None
    }

    fn run_side_effects(&self, console: &Console) -> Result<(), ProgramError> {
        console.println("module side effect");
        Ok(())
    }
}
