use super::*;

#[test]
fn cjmpz_takes_the_branch_on_zero() {
    // CONST 0; CJMPZ taken; CONST 1; JMP end; taken: CONST 2; end: write
    let mut file = build_main(|image| {
        image.emit_begin(2, 0);
        image.emit_const(0);
        let to_taken = image.emit_forward(Opcode::Cjmpz);
        image.emit_const(1);
        let to_end = image.emit_forward(Opcode::Jmp);
        let taken = image.here();
        image.emit_const(2);
        let end = image.here();
        image.emit_op(Opcode::CallLwrite);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);
        image.patch_i32(to_taken, taken as i32);
        image.patch_i32(to_end, end as i32);
    });

    assert_eq!(run_ok_both_modes(&mut file), "2\n");
}

#[test]
fn cjmpnz_falls_through_on_zero() {
    let mut file = build_main(|image| {
        image.emit_begin(2, 0);
        image.emit_const(0);
        let to_taken = image.emit_forward(Opcode::Cjmpnz);
        image.emit_const(1);
        let to_end = image.emit_forward(Opcode::Jmp);
        let taken = image.here();
        image.emit_const(2);
        let end = image.here();
        image.emit_op(Opcode::CallLwrite);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);
        image.patch_i32(to_taken, taken as i32);
        image.patch_i32(to_end, end as i32);
    });

    assert_eq!(run_ok_both_modes(&mut file), "1\n");
}

#[test]
fn dup_then_drop_is_identity() {
    let mut file = build_main(|image| {
        image.emit_begin(2, 0);
        image.emit_const(5);
        image.emit_op(Opcode::Dup);
        image.emit_op(Opcode::Drop);
        image.emit_op(Opcode::CallLwrite);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);
    });

    assert_eq!(run_ok_both_modes(&mut file), "5\n");
}

#[test]
fn swap_exchanges_the_top_two_slots() {
    // push 1, 2; swap; write both: 1 first, then 2
    let mut file = build_main(|image| {
        image.emit_begin(2, 0);
        image.emit_const(1);
        image.emit_const(2);
        image.emit_op(Opcode::Swap);
        image.emit_op(Opcode::CallLwrite);
        image.emit_op(Opcode::Drop);
        image.emit_op(Opcode::CallLwrite);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);
    });

    assert_eq!(run_ok_both_modes(&mut file), "1\n2\n");
}

#[test]
fn double_swap_is_identity() {
    let mut file = build_main(|image| {
        image.emit_begin(2, 0);
        image.emit_const(1);
        image.emit_const(2);
        image.emit_op(Opcode::Swap);
        image.emit_op(Opcode::Swap);
        image.emit_op(Opcode::CallLwrite);
        image.emit_op(Opcode::Drop);
        image.emit_op(Opcode::CallLwrite);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);
    });

    assert_eq!(run_ok_both_modes(&mut file), "2\n1\n");
}

#[test]
fn line_is_a_no_op() {
    let mut file = build_main(|image| {
        image.emit_begin(2, 0);
        image.emit_op_i32(Opcode::Line, 12);
        image.emit_const(9);
        image.emit_op_i32(Opcode::Line, 13);
        image.emit_op(Opcode::CallLwrite);
        image.emit_op(Opcode::Drop);
        image.emit_const(0);
        image.emit_op(Opcode::End);
    });

    assert_eq!(run_ok_both_modes(&mut file), "9\n");
}

#[test]
fn backward_jumps_loop() {
    // L0 = 3; while (L0 != 0) { write L0; L0 = L0 - 1 }
    let mut file = build_main(|image| {
        image.emit_begin(2, 1);
        image.emit_const(3);
        image.emit_op_i32(Opcode::StL, 0);
        image.emit_op(Opcode::Drop);
        let head = image.here();
        image.emit_op_i32(Opcode::LdL, 0);
        let to_exit = image.emit_forward(Opcode::Cjmpz);
        image.emit_op_i32(Opcode::LdL, 0);
        image.emit_op(Opcode::CallLwrite);
        image.emit_op(Opcode::Drop);
        image.emit_op_i32(Opcode::LdL, 0);
        image.emit_const(1);
        image.emit_op(Opcode::BinopSub);
        image.emit_op_i32(Opcode::StL, 0);
        image.emit_op(Opcode::Drop);
        image.emit_op_i32(Opcode::Jmp, head as i32);
        let exit = image.here();
        image.emit_const(0);
        image.emit_op(Opcode::End);
        image.patch_i32(to_exit, exit as i32);
    });

    assert_eq!(run_ok_both_modes(&mut file), "3\n2\n1\n");
}

#[test]
fn jumping_out_of_the_code_section_fails_dynamically() {
    let mut file = build_main(|image| {
        image.emit_begin(2, 0);
        image.emit_op_i32(Opcode::Jmp, 0x7fff);
        image.emit_op(Opcode::End);
    });

    let (result, _) = run(&mut file, VerificationMode::Dynamic);
    assert!(format!("{:#}", result.unwrap_err()).contains("code offset out of range"));
}
