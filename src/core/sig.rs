//! JVM-style type signature helpers.
//!
//! Signatures arrive pre-decoded from the loader but still use the compact
//! descriptor grammar (`I`, `J`, `Ljava/lang/String;`, `[I`, `(IJ)V`).

use super::errors::{AnalysisError, Result};

/// Split a method signature `(...)R` into its parameter signatures.
pub fn parse_method_params(signature: &str) -> Result<Vec<String>> {
    let inner = signature
        .strip_prefix('(')
        .and_then(|rest| rest.split_once(')'))
        .map(|(params, _)| params)
        .ok_or_else(|| {
            AnalysisError::invalid_bytecode("method signature", format!("malformed: {signature}"))
        })?;

    let mut params = Vec::new();
    let mut rest = inner;
    while !rest.is_empty() {
        let len = single_type_len(rest).ok_or_else(|| {
            AnalysisError::invalid_bytecode("method signature", format!("malformed: {signature}"))
        })?;
        params.push(rest[..len].to_string());
        rest = &rest[len..];
    }
    Ok(params)
}

/// Return type signature of a method signature.
pub fn return_type(signature: &str) -> Result<&str> {
    signature.split_once(')').map(|(_, ret)| ret).ok_or_else(|| {
        AnalysisError::invalid_bytecode("method signature", format!("malformed: {signature}"))
    })
}

/// Number of local-variable slots a value of this type occupies.
pub fn slot_width(signature: &str) -> u16 {
    match signature {
        "J" | "D" => 2,
        _ => 1,
    }
}

fn single_type_len(s: &str) -> Option<usize> {
    for (i, c) in s.char_indices() {
        match c {
            '[' => continue,
            'L' => {
                let end = s[i..].find(';')?;
                return Some(i + end + 1);
            }
            'B' | 'C' | 'D' | 'F' | 'I' | 'J' | 'S' | 'Z' => return Some(i + 1),
            _ => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_primitive_params() {
        let params = parse_method_params("(IJZ)V").unwrap();
        assert_eq!(params, vec!["I", "J", "Z"]);
    }

    #[test]
    fn parses_object_and_array_params() {
        let params = parse_method_params("(Ljava/lang/String;[I[[Lcom/example/Foo;J)I").unwrap();
        assert_eq!(
            params,
            vec!["Ljava/lang/String;", "[I", "[[Lcom/example/Foo;", "J"]
        );
    }

    #[test]
    fn rejects_malformed_signatures() {
        assert!(parse_method_params("IJZ").is_err());
        assert!(parse_method_params("(Q)V").is_err());
    }

    #[test]
    fn wide_types_take_two_slots() {
        assert_eq!(slot_width("J"), 2);
        assert_eq!(slot_width("D"), 2);
        assert_eq!(slot_width("I"), 1);
        assert_eq!(slot_width("Ljava/lang/Object;"), 1);
    }

    #[test]
    fn return_type_of_signature() {
        assert_eq!(return_type("(IJ)V").unwrap(), "V");
        assert_eq!(return_type("()Ljava/lang/String;").unwrap(), "Ljava/lang/String;");
    }
}
