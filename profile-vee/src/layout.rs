//! Versioned byte-layout table for the target runtime's heap objects.
//!
//! Every raw offset and type tag the decoder needs lives in one
//! [`V8Layout`] value selected by the target's runtime major version.
//! The numbers encode V8's private ABI and drift between releases, so a
//! version we have no table for is an explicit [`LayoutError`] up front
//! rather than a silent misdecode.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("unsupported runtime version {0} (known: 4)")]
    UnsupportedRuntime(u32),
}

/// Byte offsets and heap type tags for one V8 release line.
///
/// All offsets are relative to the *untagged* object base address.
/// Frame-pointer relative offsets are signed because the context and
/// function slots sit below the frame pointer.
#[derive(Debug)]
pub struct V8Layout {
    // Strings
    pub string_length_offset: u64,
    pub seq_string_data_offset: u64,
    pub cons_string_first_offset: u64,
    pub cons_string_second_offset: u64,

    // Map-type byte: low 3 bits encode representation, bits 0-1 layout
    pub string_repr_mask: u8,
    pub string_enc_ascii: u8,
    pub string_layout_mask: u8,
    pub string_layout_seq: u8,
    pub string_layout_cons: u8,

    // Heap object header
    pub heap_object_map_offset: u64,
    pub heap_map_type_offset: u64,

    // Instance type tags read from the map
    pub fixed_array_type: u8,
    pub builtins_object_type: u8,
    pub js_function_type: u8,
    pub code_type: u8,

    // JSFunction / SharedFunctionInfo / Script
    pub js_func_shared_info_offset: u64,
    pub js_func_context_offset: u64,
    pub shared_info_name_offset: u64,
    pub shared_info_inferred_name_offset: u64,
    pub shared_info_script_offset: u64,
    pub shared_info_start_position_offset: u64,
    pub shared_info_start_position_shift: u32,
    pub script_name_offset: u64,
    pub script_line_offset_offset: u64,
    pub script_line_ends_offset: u64,

    // FixedArray
    pub fixed_array_length_offset: u64,
    pub fixed_array_header_size: u64,

    // Stack frame slots, relative to the frame pointer
    pub fp_context_offset: i64,
    pub fp_func_offset: i64,
    pub fp_receiver_offset: i64,

    // Contexts
    pub context_header_size: u64,
    pub context_global_object_index: u64,

    // SMI marker stored in the context slot of adaptor frames
    pub arguments_adaptor_context_marker: i32,
}

/// Layout for the V8 line shipped with node 4.x.
static NODE_4: V8Layout = V8Layout {
    string_length_offset: 0x08,
    seq_string_data_offset: 0x18,
    cons_string_first_offset: 0x18,
    cons_string_second_offset: 0x20,

    string_repr_mask: 0x07,
    string_enc_ascii: 0x04,
    string_layout_mask: 0x03,
    string_layout_seq: 0x00,
    string_layout_cons: 0x01,

    heap_object_map_offset: 0x00,
    heap_map_type_offset: 0x0c,

    fixed_array_type: 0xa3,
    builtins_object_type: 0xae,
    js_function_type: 0xb5,
    code_type: 0x81,

    js_func_shared_info_offset: 0x28,
    js_func_context_offset: 0x30,
    shared_info_name_offset: 0x08,
    shared_info_inferred_name_offset: 0x50,
    shared_info_script_offset: 0x40,
    shared_info_start_position_offset: 0x84,
    shared_info_start_position_shift: 0x02,
    script_name_offset: 0x10,
    script_line_offset_offset: 0x18,
    script_line_ends_offset: 0x58,

    fixed_array_length_offset: 0x08,
    fixed_array_header_size: 0x10,

    fp_context_offset: -0x08,
    fp_func_offset: -0x10,
    fp_receiver_offset: 0x10,

    context_header_size: 0x10,
    context_global_object_index: 0x03,

    arguments_adaptor_context_marker: 0x04,
};

impl V8Layout {
    /// Select the layout table for a node.js major version.
    pub fn for_node_major(major: u32) -> Result<&'static V8Layout, LayoutError> {
        match major {
            4 => Ok(&NODE_4),
            other => Err(LayoutError::UnsupportedRuntime(other)),
        }
    }
}

/// Discriminant of a stack frame, as encoded by the runtime in the
/// function slot of marker frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    None,
    Entry,
    EntryConstruct,
    Exit,
    JavaScript,
    Optimized,
    Internal,
    Construct,
    ArgumentsAdaptor,
    /// Not a runtime frame marker at all; a native C/C++ frame.
    Native,
}

impl FrameKind {
    /// Map a frame-marker SMI to its kind. Values outside the known
    /// enumeration are native frames.
    pub fn from_marker(value: i32) -> FrameKind {
        match value {
            0 => FrameKind::None,
            1 => FrameKind::Entry,
            2 => FrameKind::EntryConstruct,
            3 => FrameKind::Exit,
            4 => FrameKind::JavaScript,
            5 => FrameKind::Optimized,
            6 => FrameKind::Internal,
            7 => FrameKind::Construct,
            8 => FrameKind::ArgumentsAdaptor,
            _ => FrameKind::Native,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_version_resolves() {
        let layout = V8Layout::for_node_major(4).unwrap();
        assert_eq!(layout.js_function_type, 0xb5);
        assert_eq!(layout.fp_func_offset, -0x10);
    }

    #[test]
    fn unknown_version_is_an_error() {
        let err = V8Layout::for_node_major(12).unwrap_err();
        assert!(matches!(err, LayoutError::UnsupportedRuntime(12)));
    }

    #[test]
    fn marker_mapping() {
        assert_eq!(FrameKind::from_marker(1), FrameKind::Entry);
        assert_eq!(FrameKind::from_marker(3), FrameKind::Exit);
        assert_eq!(FrameKind::from_marker(8), FrameKind::ArgumentsAdaptor);
        assert_eq!(FrameKind::from_marker(42), FrameKind::Native);
        assert_eq!(FrameKind::from_marker(-1), FrameKind::Native);
    }
}
