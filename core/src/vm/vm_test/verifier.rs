use super::*;
use crate::bytecode::unpack_begin_metadata;
use crate::vm::{Verification, verify};

fn verify_main(emit: impl FnOnce(&mut ImageBuilder)) -> (BytecodeFile, Result<Verification, crate::vm::VerifyError>) {
    let mut file = build_main(emit);
    let outcome = verify(&mut file);

    (file, outcome)
}

#[test]
fn begin_operand_carries_the_max_stack_growth() {
    // (1 + 2) + (3 * 4): the expression stack peaks at three slots.
    let (file, outcome) = verify_main(|image| {
        image.emit_begin(2, 0);
        image.emit_const(1);
        image.emit_const(2);
        image.emit_op(Opcode::BinopAdd);
        image.emit_const(3);
        image.emit_const(4);
        image.emit_op(Opcode::BinopMul);
        image.emit_op(Opcode::BinopAdd);
        image.emit_op(Opcode::CallLwrite);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);
    });

    assert_eq!(outcome.unwrap(), Verification::Complete);
    let (max_stack, locals) = unpack_begin_metadata(file.code_i32(5).unwrap());
    assert_eq!(max_stack, 3);
    assert_eq!(locals, 0);
}

#[test]
fn locals_count_survives_patching() {
    let (file, outcome) = verify_main(|image| {
        image.emit_begin(2, 3);
        image.emit_op_i32(Opcode::LdL, 2);
        image.emit_op(Opcode::End);
    });

    assert_eq!(outcome.unwrap(), Verification::Complete);
    let (max_stack, locals) = unpack_begin_metadata(file.code_i32(5).unwrap());
    assert_eq!(locals, 3);
    assert_eq!(max_stack, 1);
}

#[test]
fn every_traversed_function_is_annotated() {
    let (file, outcome) = verify_main(|image| {
        image.emit_begin(2, 0);
        image.emit_const(1);
        let call_slot = image.emit_forward(Opcode::Call);
        image.emit_i32(1);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);

        let f = image.here();
        image.patch_i32(call_slot, f as i32);
        image.emit_begin(1, 0);
        image.emit_op_i32(Opcode::LdA, 0);
        image.emit_op_i32(Opcode::LdA, 0);
        image.emit_op(Opcode::BinopMul);
        image.emit_op(Opcode::End);
    });

    assert_eq!(outcome.unwrap(), Verification::Complete);
    // main peaks at CONST 1 + staged return ip.
    let (main_max, _) = unpack_begin_metadata(file.code_i32(5).unwrap());
    assert_eq!(main_max, 2);
    // f peaks at two loaded arguments.
    let f_begin = 30;
    let (f_max, _) = unpack_begin_metadata(file.code_i32(f_begin + 5).unwrap());
    assert_eq!(f_max, 2);
}

#[test]
fn sta_makes_verification_incomplete_without_patching() {
    let (file, outcome) = verify_main(|image| {
        image.emit_begin(2, 1);
        image.emit_op_i32(Opcode::LdaL, 0);
        image.emit_const(5);
        image.emit_op(Opcode::Sta);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);
    });

    assert_eq!(outcome.unwrap(), Verification::Incomplete);
    // The second BEGIN operand still holds the bare locals count.
    let (max_stack, locals) = unpack_begin_metadata(file.code_i32(5).unwrap());
    assert_eq!((max_stack, locals), (0, 1));
}

#[test]
fn operand_range_errors_are_reported_with_offsets() {
    // Local index out of range
    let (_, outcome) = verify_main(|image| {
        image.emit_begin(2, 1);
        image.emit_op_i32(Opcode::LdL, 4);
        image.emit_op(Opcode::End);
    });
    let err = outcome.unwrap_err();
    assert!(err.to_string().contains("local value index out of range"));
    assert_eq!(err.offset, 9);

    // Argument index out of range
    let (_, outcome) = verify_main(|image| {
        image.emit_begin(2, 0);
        image.emit_op_i32(Opcode::LdA, 2);
        image.emit_op(Opcode::End);
    });
    assert!(
        outcome
            .unwrap_err()
            .to_string()
            .contains("argument value index out of range")
    );

    // Global index out of range (no globals declared)
    let (_, outcome) = verify_main(|image| {
        image.emit_begin(2, 0);
        image.emit_op_i32(Opcode::LdG, 0);
        image.emit_op(Opcode::End);
    });
    assert!(
        outcome
            .unwrap_err()
            .to_string()
            .contains("global value index out of range")
    );

    // String table index out of range
    let (_, outcome) = verify_main(|image| {
        image.emit_begin(2, 0);
        image.emit_op_i32(Opcode::String, 999);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);
    });
    assert!(
        outcome
            .unwrap_err()
            .to_string()
            .contains("string table index is out of range")
    );
}

#[test]
fn stack_underflow_is_detected() {
    let (_, outcome) = verify_main(|image| {
        image.emit_begin(2, 0);
        image.emit_op(Opcode::BinopAdd);
        image.emit_op(Opcode::End);
    });

    assert!(outcome.unwrap_err().to_string().contains("operand stack is empty"));
}

#[test]
fn call_argument_count_must_match_the_prologue() {
    let (_, outcome) = verify_main(|image| {
        image.emit_begin(2, 0);
        image.emit_const(1);
        image.emit_const(2);
        let call_slot = image.emit_forward(Opcode::Call);
        image.emit_i32(2);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);

        let f = image.here();
        image.patch_i32(call_slot, f as i32);
        image.emit_begin(1, 0); // declares one argument, called with two
        image.emit_op_i32(Opcode::LdA, 0);
        image.emit_op(Opcode::End);
    });

    assert!(
        outcome
            .unwrap_err()
            .to_string()
            .contains("differs from the number declared in BEGIN")
    );
}

#[test]
fn call_to_a_non_prologue_target_is_rejected() {
    let (_, outcome) = verify_main(|image| {
        image.emit_begin(2, 0);
        let target = image.here() + 9; // the CONST below
        image.emit_call(target, 0);
        image.emit_const(1);
        image.emit_op(Opcode::Drop);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);
    });

    assert!(
        outcome
            .unwrap_err()
            .to_string()
            .contains("CALL should go to BEGIN instruction")
    );
}

#[test]
fn closure_bodies_are_traversed_from_the_closure_site() {
    // The CBEGIN body loads a local that does not exist; only the
    // closure-site seeding can reach it.
    let (_, outcome) = verify_main(|image| {
        image.emit_begin(2, 0);
        let closure_at = image.here();
        image.emit_closure(0, &[]);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);

        let body = image.here();
        image.patch_i32(closure_at + 1, body as i32);
        image.emit_cbegin(0, 0);
        image.emit_op_i32(Opcode::LdL, 7);
        image.emit_op(Opcode::End);
    });

    assert!(
        outcome
            .unwrap_err()
            .to_string()
            .contains("local value index out of range")
    );
}

#[test]
fn malformed_closure_varspec_is_rejected() {
    let (_, outcome) = verify_main(|image| {
        image.emit_begin(2, 0);
        let closure_at = image.here();
        image.emit_op(Opcode::Closure);
        image.emit_i32(0);
        image.emit_i32(1);
        image.emit_i32(0x0505_0505); // varspec kind 5: invalid
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);

        let body = image.here();
        image.patch_i32(closure_at + 1, body as i32);
        image.emit_cbegin(0, 0);
        image.emit_const(1);
        image.emit_op(Opcode::End);
    });

    assert!(outcome.unwrap_err().to_string().contains("invalid varspec"));
}

#[test]
fn fail_operands_must_be_positive() {
    let (_, outcome) = verify_main(|image| {
        image.emit_begin(2, 0);
        image.emit_const(1);
        image.emit_op_i32x2(Opcode::Fail, 0, 4);
        image.emit_op(Opcode::End);
    });

    assert!(
        outcome
            .unwrap_err()
            .to_string()
            .contains("line number should be greater than 0")
    );
}

#[test]
fn invalid_opcode_bytes_are_rejected() {
    let (_, outcome) = verify_main(|image| {
        image.emit_begin(2, 0);
        image.emit_const(1);
        image.emit_op(Opcode::Drop);
        image.emit_i32(-286331157); // 0xeeeeeeeb: garbage in the code stream
        image.emit_op(Opcode::End);
    });

    assert!(outcome.unwrap_err().to_string().contains("invalid instruction"));
}

#[test]
fn recursion_reaches_a_fixpoint() {
    let (file, outcome) = verify_main(|image| {
        image.emit_begin(2, 0);
        image.emit_const(5);
        let call_slot = image.emit_forward(Opcode::Call);
        image.emit_i32(1);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);

        let fact = image.here();
        image.patch_i32(call_slot, fact as i32);
        image.emit_begin(1, 0);
        image.emit_op_i32(Opcode::LdA, 0);
        let to_base = image.emit_forward(Opcode::Cjmpz);
        image.emit_op_i32(Opcode::LdA, 0);
        image.emit_op_i32(Opcode::LdA, 0);
        image.emit_const(1);
        image.emit_op(Opcode::BinopSub);
        image.emit_call(fact, 1);
        image.emit_op(Opcode::BinopMul);
        let to_out = image.emit_forward(Opcode::Jmp);
        let base = image.here();
        image.emit_const(1);
        let out = image.here();
        image.emit_op(Opcode::End);
        image.patch_i32(to_base, base as i32);
        image.patch_i32(to_out, out as i32);
    });

    assert_eq!(outcome.unwrap(), Verification::Complete);
    // fact stages two arguments plus the return ip of the recursive call.
    let fact_begin = 30;
    let (fact_max, _) = unpack_begin_metadata(file.code_i32(fact_begin + 5).unwrap());
    assert_eq!(fact_max, 3);
}
