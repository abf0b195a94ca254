//! End-to-end programs exercising the loader, verifier and interpreter
//! together.

use super::*;

#[test]
fn hello_constant() {
    // main = BEGIN 2 0; CONST 42; CALL Lwrite; DROP; CONST 0; END
    let mut file = build_main(|image| {
        image.emit_begin(2, 0);
        image.emit_const(42);
        image.emit_op(Opcode::CallLwrite);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);
    });

    assert_eq!(run_ok_both_modes(&mut file), "42\n");
}

#[test]
fn arithmetic_difference() {
    let mut file = build_main(|image| {
        image.emit_begin(2, 0);
        image.emit_const(7);
        image.emit_const(5);
        image.emit_op(Opcode::BinopSub);
        image.emit_op(Opcode::CallLwrite);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);
    });

    assert_eq!(run_ok_both_modes(&mut file), "2\n");
}

#[test]
fn branch_on_zero() {
    let mut file = build_main(|image| {
        image.emit_begin(2, 0);
        image.emit_const(0);
        let to_else = image.emit_forward(Opcode::Cjmpz);
        image.emit_const(1);
        let to_join = image.emit_forward(Opcode::Jmp);
        let else_arm = image.here();
        image.emit_const(2);
        let join = image.here();
        image.emit_op(Opcode::CallLwrite);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);
        image.patch_i32(to_else, else_arm as i32);
        image.patch_i32(to_join, join as i32);
    });

    assert_eq!(run_ok_both_modes(&mut file), "2\n");
}

#[test]
fn function_call_adds_its_arguments() {
    let mut file = build_main(|image| {
        image.emit_begin(2, 0);
        image.emit_const(3);
        image.emit_const(4);
        let call_slot = image.emit_forward(Opcode::Call);
        image.emit_i32(2);
        image.emit_op(Opcode::CallLwrite);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);

        let f = image.here();
        image.patch_i32(call_slot, f as i32);
        image.emit_begin(2, 0);
        image.emit_op_i32(Opcode::LdA, 0);
        image.emit_op_i32(Opcode::LdA, 1);
        image.emit_op(Opcode::BinopAdd);
        image.emit_op(Opcode::End);
    });

    assert_eq!(run_ok_both_modes(&mut file), "7\n");
}

#[test]
fn closure_maker_applies_its_capture() {
    // mk() returns a closure over its local; main calls the result with 10.
    let mut file = build_main(|image| {
        image.emit_begin(2, 0);
        let mk_call = image.emit_forward(Opcode::Call);
        image.emit_i32(0);
        image.emit_const(10);
        image.emit_op_i32(Opcode::Callc, 1);
        image.emit_op(Opcode::CallLwrite);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);

        let mk = image.here();
        image.patch_i32(mk_call, mk as i32);
        image.emit_begin(0, 1);
        image.emit_const(32);
        image.emit_op_i32(Opcode::StL, 0);
        image.emit_op(Opcode::Drop);
        let closure_at = image.here();
        image.emit_closure(0, &[(CaptureKind::Local, 0)]);
        image.emit_op(Opcode::End);

        let body = image.here();
        image.patch_i32(closure_at + 1, body as i32);
        image.emit_cbegin(1, 0);
        image.emit_op_i32(Opcode::LdC, 0);
        image.emit_op_i32(Opcode::LdA, 0);
        image.emit_op(Opcode::BinopAdd);
        image.emit_op(Opcode::End);
    });

    assert_eq!(run_ok_both_modes(&mut file), "42\n");
}

#[test]
fn verifier_rejects_stack_depth_mismatch_before_execution() {
    // Two arms join at the same offset with depths 2 and 1.
    let mut file = build_main(|image| {
        image.emit_begin(2, 0);
        image.emit_const(0);
        let to_arm = image.emit_forward(Opcode::Cjmpz);
        image.emit_const(1);
        image.emit_const(2);
        let join_a = image.emit_forward(Opcode::Jmp);
        let arm = image.here();
        image.emit_const(3);
        let join = image.here();
        image.emit_op(Opcode::CallLwrite);
        image.emit_op(Opcode::Drop);
        image.emit_op(Opcode::CallLwrite);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);
        image.patch_i32(to_arm, arm as i32);
        image.patch_i32(join_a, join as i32);
    });

    let (result, output) = run(&mut file, VerificationMode::Static);
    let rendered = format!("{:#}", result.unwrap_err());
    assert!(rendered.contains("stack size inconsistency"), "got: {}", rendered);
    // Verification failed before the first instruction executed.
    assert_eq!(output, "");
}

#[test]
fn missing_entry_point_is_an_error_in_both_modes() {
    let mut image = ImageBuilder::new();
    let name = image.intern_string("helper");
    image.add_public(name, 0);
    image.emit_begin(2, 0);
    image.emit_const(0);
    image.emit_op(Opcode::End);
    let mut file = parse_image("no-main.bc", &image.build()).expect("image parses");

    for mode in [VerificationMode::Dynamic, VerificationMode::Static] {
        let (result, _) = run(&mut file, mode);
        assert!(
            format!("{:#}", result.unwrap_err()).contains("is not defined"),
            "mode {:?}",
            mode
        );
    }
}
