use std::collections::HashMap;

use optic_resource::{FrameRef, ResourceId};
use optic_wrap::Call;

/// One frame event: a recorded call, addressable by id and by byte offset
/// into the capture for direct seeking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDesc {
    pub event_id: u32,
    pub name: String,
    pub offset: u64,
    pub is_action: bool,
}

/// Node of the drawcall tree: marker regions nest, actions are leaves. This
/// tree, not the flat chunk order, is what a consumer walks to pick "the
/// state just before/after event N".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawcallNode {
    pub event_id: u32,
    pub name: String,
    pub children: Vec<DrawcallNode>,
}

impl DrawcallNode {
    fn new(event_id: u32, name: String) -> Self {
        Self {
            event_id,
            name,
            children: Vec::new(),
        }
    }

    /// Depth-first count of action leaves under this node.
    pub fn action_count(&self) -> usize {
        self.children
            .iter()
            .map(|c| c.action_count() + usize::from(c.children.is_empty()))
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventUsage {
    pub event_id: u32,
    pub usage: FrameRef,
}

/// The ordered, nested log of one captured frame, built while scanning the
/// frame's chunk stream.
#[derive(Debug, Clone)]
pub struct FrameLog {
    pub frame: u64,
    pub events: Vec<EventDesc>,
    pub root: DrawcallNode,
    pub usage: HashMap<ResourceId, Vec<EventUsage>>,
    pub callstack: Option<Vec<u64>>,
}

impl FrameLog {
    pub fn event(&self, event_id: u32) -> Option<&EventDesc> {
        // Events are dense and 1-based.
        self.events.get(event_id.checked_sub(1)? as usize)
    }

    pub fn drawcall_tree(&self) -> &DrawcallNode {
        &self.root
    }

    pub fn usage_of(&self, id: ResourceId) -> &[EventUsage] {
        self.usage.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn last_event(&self) -> u32 {
        self.events.len() as u32
    }
}

/// Accumulates events into the tree as the frame's chunks stream past.
/// Maintains the explicit stack of the current nesting scope.
pub struct FrameLogBuilder {
    frame: u64,
    events: Vec<EventDesc>,
    stack: Vec<DrawcallNode>,
    usage: HashMap<ResourceId, Vec<EventUsage>>,
}

impl FrameLogBuilder {
    pub fn new(frame: u64) -> Self {
        Self {
            frame,
            events: Vec::new(),
            stack: vec![DrawcallNode::new(0, format!("Frame #{frame}"))],
            usage: HashMap::new(),
        }
    }

    /// Record one frame call. Returns the event id assigned to it.
    pub fn add_event(&mut self, offset: u64, call: &Call) -> u32 {
        let event_id = self.events.len() as u32 + 1;
        let name = match call {
            Call::PushMarker { name } | Call::SetMarker { name } => name.clone(),
            _ => call.name().to_owned(),
        };
        self.events.push(EventDesc {
            event_id,
            name: name.clone(),
            offset,
            is_action: call.is_action(),
        });

        for (id, usage) in call.direct_references() {
            self.usage
                .entry(id)
                .or_default()
                .push(EventUsage { event_id, usage });
        }

        match call {
            Call::PushMarker { .. } => {
                self.stack.push(DrawcallNode::new(event_id, name));
            }
            Call::PopMarker => {
                // Unbalanced pops belong to the root scope; never pop it.
                if self.stack.len() > 1 {
                    let node = self.stack.pop().expect("marker stack underflow");
                    self.current().children.push(node);
                }
            }
            Call::SetMarker { .. } => {
                self.current().children.push(DrawcallNode::new(event_id, name));
            }
            call if call.is_action() => {
                self.current().children.push(DrawcallNode::new(event_id, name));
            }
            _ => {}
        }
        event_id
    }

    /// Record a non-call event chunk (diagnostics, unknown future kinds) so
    /// event numbering stays aligned with the chunks the writer counted.
    pub fn add_misc_event(&mut self, offset: u64, name: &str) -> u32 {
        let event_id = self.events.len() as u32 + 1;
        self.events.push(EventDesc {
            event_id,
            name: name.to_owned(),
            offset,
            is_action: false,
        });
        event_id
    }

    fn current(&mut self) -> &mut DrawcallNode {
        self.stack.last_mut().expect("marker stack underflow")
    }

    pub fn finish(mut self, callstack: Option<Vec<u64>>) -> FrameLog {
        // Unclosed marker regions collapse into their parents.
        while self.stack.len() > 1 {
            let node = self.stack.pop().expect("marker stack underflow");
            self.current().children.push(node);
        }
        let root = self.stack.pop().expect("marker stack underflow");
        FrameLog {
            frame: self.frame,
            events: self.events,
            root,
            usage: self.usage,
            callstack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_nest_and_actions_attach_to_the_open_region() {
        let mut b = FrameLogBuilder::new(3);
        b.add_event(100, &Call::PushMarker { name: "scene".into() });
        b.add_event(
            140,
            &Call::Draw {
                vertex_count: 3,
                first_vertex: 0,
            },
        );
        b.add_event(180, &Call::PushMarker { name: "shadows".into() });
        b.add_event(220, &Call::Dispatch { x: 8, y: 8, z: 1 });
        b.add_event(260, &Call::PopMarker);
        b.add_event(300, &Call::PopMarker);
        b.add_event(
            340,
            &Call::Draw {
                vertex_count: 6,
                first_vertex: 0,
            },
        );
        let log = b.finish(None);

        assert_eq!(log.last_event(), 7);
        let scene = &log.root.children[0];
        assert_eq!(scene.name, "scene");
        assert_eq!(scene.children.len(), 2);
        assert_eq!(scene.children[1].name, "shadows");
        assert_eq!(scene.children[1].children[0].name, "Dispatch");
        assert_eq!(log.root.children[1].name, "Draw");

        let draw = log.event(2).unwrap();
        assert!(draw.is_action);
        assert_eq!(draw.offset, 140);
    }

    #[test]
    fn unbalanced_markers_do_not_lose_events() {
        let mut b = FrameLogBuilder::new(0);
        b.add_event(0, &Call::PopMarker); // stray pop
        b.add_event(10, &Call::PushMarker { name: "open".into() });
        b.add_event(
            20,
            &Call::Draw {
                vertex_count: 3,
                first_vertex: 0,
            },
        );
        // Never popped.
        let log = b.finish(None);
        assert_eq!(log.root.children.len(), 1);
        assert_eq!(log.root.children[0].children.len(), 1);
    }

    #[test]
    fn usage_lists_record_direct_references() {
        use optic_wrap::ShaderStage;
        let id = ResourceId::from_raw(5);
        let mut b = FrameLogBuilder::new(0);
        b.add_event(
            0,
            &Call::BindConstantBuffers {
                stage: ShaderStage::Pixel,
                first_slot: 0,
                buffers: vec![id],
            },
        );
        b.add_event(
            10,
            &Call::UpdateResource {
                resource: id,
                offset: 0,
                data: vec![1, 2, 3],
            },
        );
        let log = b.finish(None);
        let usage = log.usage_of(id);
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].usage, FrameRef::Read);
        assert_eq!(usage[1].usage, FrameRef::Write);
    }
}
