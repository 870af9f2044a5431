//! Heap and stack decoding for the target runtime's object model.
//!
//! Turns raw (program counter, frame pointer) pairs captured from a
//! suspended process into symbolic frame annotations by walking V8's
//! tagged-pointer object graph: map-typed heap objects, flat and cons
//! strings, shared function info, script line tables and frame markers.
//!
//! The target may be mid-GC or the addresses may be garbage, so no read
//! fault escapes this module: every public decode path has a defined
//! fallback value.

use crate::frames::FrameAnnotation;
use crate::layout::{FrameKind, V8Layout};
use crate::mem::{ProcessMemory, ReadFault};

/// Recursion cap for lazily concatenated (cons) strings.
const MAX_CONS_STRING_DEPTH: u32 = 5;
/// Marker substituted when the cons depth cap is hit.
const TRUNCATION_MARKER: &str = "...";
/// Marker for a string of a shape we don't decode.
const UNKNOWN_STRING_MARKER: &str = "[unknown]";
/// Wide (two-byte) strings are cut off after this many code units.
const MAX_WIDE_STRING_UNITS: i32 = 200;

/// A tagged machine word: low bit clear means an inline small integer,
/// low bit set means a heap object pointer that must be untagged before
/// dereference.
pub fn is_smi(word: u64) -> bool {
    word & 1 == 0
}

/// Decode the integer payload of a tagged small-integer word.
pub fn smi_value(word: u64) -> i32 {
    ((word >> 32) as u32) as i32
}

/// Strip the pointer tag bit.
pub fn untag(addr: u64) -> u64 {
    addr & !1
}

pub struct HeapReader<M> {
    mem: M,
    layout: &'static V8Layout,
}

impl<M: ProcessMemory> HeapReader<M> {
    pub fn new(mem: M, layout: &'static V8Layout) -> Self {
        HeapReader { mem, layout }
    }

    fn word(&self, addr: u64) -> Result<u64, ReadFault> {
        self.mem.read_u64(addr)
    }

    /// Follow a tagged pointer slot: untag the slot address, load the
    /// word, untag the result.
    fn read_pointer(&self, addr: u64) -> Result<u64, ReadFault> {
        Ok(untag(self.word(untag(addr))?))
    }

    fn read_smi(&self, addr: u64) -> Result<i32, ReadFault> {
        Ok(smi_value(self.word(addr)?))
    }

    /// Instance type tag of a heap object, read through its map.
    fn heap_object_type(&self, obj: u64) -> Result<u8, ReadFault> {
        let map = self.read_pointer(obj + self.layout.heap_object_map_offset)?;
        self.mem.read_u8(map + self.layout.heap_map_type_offset)
    }

    fn string_shape(&self, string: u64) -> Result<u8, ReadFault> {
        Ok(self.heap_object_type(string)? & self.layout.string_repr_mask)
    }

    fn string_length(&self, string: u64) -> Result<i32, ReadFault> {
        self.read_smi(string + self.layout.string_length_offset)
    }

    fn read_narrow_string(&self, addr: u64, length: i32) -> Result<String, ReadFault> {
        let mut addr = untag(addr);
        let mut out = String::with_capacity(length.max(0) as usize);
        for _ in 0..length {
            out.push(self.mem.read_u8(addr)? as char);
            addr += 1;
        }
        Ok(out)
    }

    fn read_wide_string(&self, addr: u64, length: i32) -> Result<String, ReadFault> {
        let mut addr = untag(addr);
        let mut out = String::new();
        for _ in 0..length.min(MAX_WIDE_STRING_UNITS) {
            let unit = self.mem.read_u16(addr)?;
            out.push(char::from_u32(unit as u32).unwrap_or(char::REPLACEMENT_CHARACTER));
            addr += 2;
        }
        Ok(out)
    }

    fn read_cons_string(&self, string: u64, depth: u32) -> Result<String, ReadFault> {
        let first = self.read_pointer(string + self.layout.cons_string_first_offset)?;
        let second = self.read_pointer(string + self.layout.cons_string_second_offset)?;
        let mut joined = self.read_string_at_depth(first, depth + 1)?;
        joined.push_str(&self.read_string_at_depth(second, depth + 1)?);
        Ok(joined)
    }

    fn read_string_at_depth(&self, addr: u64, depth: u32) -> Result<String, ReadFault> {
        if depth >= MAX_CONS_STRING_DEPTH {
            return Ok(TRUNCATION_MARKER.to_string());
        }

        let string = untag(addr);
        let length = self.string_length(string)?;
        if length == 0 {
            // no shape or data reads for the empty string
            return Ok(String::new());
        }

        let shape = self.string_shape(string)?;
        let layout = self.layout;

        if shape == (layout.string_enc_ascii | layout.string_layout_seq) {
            self.read_narrow_string(string + layout.seq_string_data_offset, length)
        } else if shape == layout.string_layout_seq {
            self.read_wide_string(string + layout.seq_string_data_offset, length)
        } else if shape & layout.string_layout_mask == layout.string_layout_cons {
            self.read_cons_string(string, depth)
        } else {
            Ok(UNKNOWN_STRING_MARKER.to_string())
        }
    }

    /// Materialize a string object, bounded by the cons depth cap.
    pub fn read_string(&self, addr: u64) -> Result<String, ReadFault> {
        self.read_string_at_depth(addr, 0)
    }

    fn fixed_array_length(&self, array: u64) -> Result<i32, ReadFault> {
        self.read_smi(array + self.layout.fixed_array_length_offset)
    }

    fn fixed_array_smi(&self, array: u64, index: i32) -> Result<i32, ReadFault> {
        self.read_smi(array + self.layout.fixed_array_header_size + 8 * index as u64)
    }

    fn shared_info(&self, func: u64) -> Result<u64, ReadFault> {
        self.read_pointer(func + self.layout.js_func_shared_info_offset)
    }

    fn shared_info_name(&self, shared: u64) -> Result<String, ReadFault> {
        let mut name = self.read_pointer(shared + self.layout.shared_info_name_offset)?;
        if self.string_length(name)? == 0 {
            name = self.read_pointer(shared + self.layout.shared_info_inferred_name_offset)?;
        }
        self.read_string(name)
    }

    fn shared_info_file_name(&self, shared: u64) -> Result<String, ReadFault> {
        let script = self.read_pointer(shared + self.layout.shared_info_script_offset)?;
        let name = self.read_pointer(script + self.layout.script_name_offset)?;
        self.read_string(name)
    }

    /// Line number of a function via its script's line-ends table.
    ///
    /// The table is a monotonically increasing array of line-end source
    /// offsets; the line index is the lower bound of the function's
    /// start position. A table with an unexpected type tag or a start
    /// position past the last line end yields `None`, never a guess.
    fn shared_info_line_number(&self, shared: u64) -> Result<Option<i32>, ReadFault> {
        let layout = self.layout;
        let start_position = self
            .mem
            .read_u32(shared + layout.shared_info_start_position_offset)?
            >> layout.shared_info_start_position_shift;
        let start_position = start_position as i32;

        let script = self.read_pointer(shared + layout.shared_info_script_offset)?;
        let line_ends = self.read_pointer(script + layout.script_line_ends_offset)?;
        let line_offset = self.read_smi(script + layout.script_line_offset_offset)?;

        if self.heap_object_type(line_ends)? != layout.fixed_array_type {
            return Ok(None);
        }

        let size = self.fixed_array_length(line_ends)?;
        if size <= 0 {
            return Ok(None);
        }

        let mut low = 0;
        let mut high = size - 1;
        while low < high {
            let mid = (low + high) / 2;
            if self.fixed_array_smi(line_ends, mid)? < start_position {
                low = mid + 1;
            } else {
                high = mid;
            }
        }

        if self.fixed_array_smi(line_ends, low)? < start_position {
            return Ok(None);
        }

        let line = low + line_offset;
        Ok(if line >= 0 { Some(line) } else { None })
    }

    /// Decode a function object into a managed frame annotation.
    ///
    /// Each sub-step tolerates faults on its own; a frame where nothing
    /// decodes still comes back as a managed frame with placeholders.
    fn read_managed_function(&self, func: u64) -> FrameAnnotation {
        let shared = match self.shared_info(func) {
            Ok(shared) => shared,
            Err(_) => {
                return FrameAnnotation::Managed {
                    function: None,
                    file: None,
                    line: None,
                }
            }
        };

        FrameAnnotation::Managed {
            function: self.shared_info_name(shared).ok(),
            file: self.shared_info_file_name(shared).ok(),
            line: self.shared_info_line_number(shared).ok().flatten(),
        }
    }

    /// Classify a frame by its context and function slots.
    fn frame_kind(&self, fp: u64) -> Result<FrameKind, ReadFault> {
        let layout = self.layout;
        let fp = untag(fp);

        let context = self.word(fp.wrapping_add_signed(layout.fp_context_offset))?;
        if is_smi(context) && smi_value(context) == layout.arguments_adaptor_context_marker {
            return Ok(FrameKind::ArgumentsAdaptor);
        }

        let func = self.word(fp.wrapping_add_signed(layout.fp_func_offset))?;
        if is_smi(func) {
            return Ok(FrameKind::from_marker(smi_value(func)));
        }

        // A fault on the type lookup means the slot held garbage, not a
        // function object; treat it as native rather than failing the
        // whole frame.
        let type_tag = self.heap_object_type(func).unwrap_or(0);
        if type_tag == layout.js_function_type {
            Ok(FrameKind::JavaScript)
        } else if type_tag == layout.code_type {
            Ok(FrameKind::Internal)
        } else {
            Ok(FrameKind::Native)
        }
    }

    fn context_slot(&self, context: u64, index: u64) -> Result<u64, ReadFault> {
        self.read_pointer(context + self.layout.context_header_size + index * 8)
    }

    /// Receiver-based builtin check. Best effort: a fault means "not a
    /// builtin".
    fn frame_is_builtin(&self, fp: u64) -> bool {
        let probe = || -> Result<bool, ReadFault> {
            let receiver =
                self.read_pointer(fp.wrapping_add_signed(self.layout.fp_receiver_offset))?;
            Ok(self.heap_object_type(receiver)? == self.layout.builtins_object_type)
        };
        probe().unwrap_or(false)
    }

    /// Context-based builtin check for functions whose enclosing global
    /// object is the builtins object. Best effort like the receiver
    /// check.
    fn function_is_hidden_builtin(&self, func: u64) -> bool {
        let probe = || -> Result<bool, ReadFault> {
            let context = self.read_pointer(func + self.layout.js_func_context_offset)?;
            let global = self.context_slot(context, self.layout.context_global_object_index)?;
            Ok(self.heap_object_type(global)? == self.layout.builtins_object_type)
        };
        probe().unwrap_or(false)
    }

    /// Decode one (program counter, frame pointer) pair into a frame
    /// annotation. Total: any fault during classification degrades to
    /// `Unknown` with the raw frame pointer for diagnostics.
    pub fn annotate_frame(&self, pc: u64, fp: u64) -> Option<FrameAnnotation> {
        if pc == 0 && fp == 0 {
            return None;
        }

        let kind = match self.frame_kind(fp) {
            Ok(kind) => kind,
            Err(_) => return Some(FrameAnnotation::Unknown { address: fp }),
        };

        if kind == FrameKind::JavaScript {
            let func = match self.read_pointer(fp.wrapping_add_signed(self.layout.fp_func_offset))
            {
                Ok(func) => func,
                Err(_) => return Some(FrameAnnotation::Unknown { address: fp }),
            };

            if self.frame_is_builtin(fp) || self.function_is_hidden_builtin(func) {
                return Some(FrameAnnotation::Builtin);
            }

            return Some(self.read_managed_function(func));
        }

        Some(match kind {
            FrameKind::Entry => FrameAnnotation::Entry,
            FrameKind::EntryConstruct => FrameAnnotation::ConstructorEntry,
            FrameKind::Construct => FrameAnnotation::Constructor,
            FrameKind::ArgumentsAdaptor => FrameAnnotation::ArgumentsAdaptor,
            FrameKind::Exit => FrameAnnotation::Exit,
            FrameKind::Internal => FrameAnnotation::InternalRuntime,
            _ => FrameAnnotation::Native {
                address: pc,
                symbol: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smi_round_trip() {
        for n in [0i32, 1, -1, 7, 4242, i32::MAX, i32::MIN] {
            let word = (n as u32 as u64) << 32;
            assert!(is_smi(word));
            assert_eq!(smi_value(word), n);
        }
    }

    #[test]
    fn tag_bit_discriminates() {
        assert!(is_smi(0));
        assert!(is_smi(4 << 32));
        assert!(!is_smi(0x1001));
        assert_eq!(untag(0x1001), 0x1000);
        assert_eq!(untag(0x1000), 0x1000);
    }
}
