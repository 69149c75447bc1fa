//! Field and method descriptor sizing
//!
//! Only the slot counts matter to the stack analysis: `J` and `D` take two
//! slots, every other type one, `V` none.

/// Slots taken by a single field type starting at `chars[*pos]`; advances `pos`
fn field_type_slots(chars: &[u8], pos: &mut usize) -> Option<u16> {
    let c = *chars.get(*pos)?;
    *pos += 1;
    match c {
        b'J' | b'D' => Some(2),
        b'B' | b'C' | b'F' | b'I' | b'S' | b'Z' => Some(1),
        b'L' => {
            let end = chars[*pos..].iter().position(|&b| b == b';')?;
            *pos += end + 1;
            Some(1)
        }
        b'[' => {
            while chars.get(*pos) == Some(&b'[') {
                *pos += 1;
            }
            field_type_slots(chars, pos)?;
            Some(1)
        }
        _ => None,
    }
}

/// Slots taken by a field of this descriptor
#[must_use]
pub fn field_slots(descriptor: &str) -> Option<u16> {
    let bytes = descriptor.as_bytes();
    let mut pos = 0;
    let slots = field_type_slots(bytes, &mut pos)?;
    (pos == bytes.len()).then_some(slots)
}

/// Argument and return slots of a method descriptor, `this` excluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodShape {
    pub arg_slots: u16,
    pub return_slots: u16,
}

#[must_use]
pub fn method_shape(descriptor: &str) -> Option<MethodShape> {
    let bytes = descriptor.as_bytes();
    if bytes.first() != Some(&b'(') {
        return None;
    }

    let mut pos = 1;
    let mut arg_slots: u16 = 0;
    while *bytes.get(pos)? != b')' {
        arg_slots = arg_slots.checked_add(field_type_slots(bytes, &mut pos)?)?;
    }
    pos += 1;

    let return_slots = if bytes.get(pos) == Some(&b'V') {
        pos += 1;
        0
    } else {
        field_type_slots(bytes, &mut pos)?
    };

    (pos == bytes.len()).then_some(MethodShape { arg_slots, return_slots })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_slots() {
        assert_eq!(field_slots("I"), Some(1));
        assert_eq!(field_slots("J"), Some(2));
        assert_eq!(field_slots("Ljava/lang/String;"), Some(1));
        assert_eq!(field_slots("[[D"), Some(1));
        assert_eq!(field_slots("Q"), None);
        assert_eq!(field_slots("II"), None);
    }

    #[test]
    fn test_method_shape() {
        assert_eq!(method_shape("()V"), Some(MethodShape { arg_slots: 0, return_slots: 0 }));
        assert_eq!(
            method_shape("(IJLjava/lang/String;[D)D"),
            Some(MethodShape { arg_slots: 5, return_slots: 2 })
        );
        assert_eq!(
            method_shape("(Ljava/lang/String;Ljava/lang/String;)V"),
            Some(MethodShape { arg_slots: 2, return_slots: 0 })
        );
    }

    #[test]
    fn test_method_shape_rejects_garbage() {
        assert_eq!(method_shape("I"), None);
        assert_eq!(method_shape("(I"), None);
        assert_eq!(method_shape("(Ljava/lang/String)V"), None);
        assert_eq!(method_shape("()VV"), None);
    }
}
