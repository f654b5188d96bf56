//! Build a small section by hand, settle it, and dump the image.
//!
//! Run with: `cargo run --example layout`

use asm_core::arch::Generic;
use asm_core::intnum::IntNum;
use asm_core::{
    output_section, BasicOutput, Bytecode, Contents, Errwarns, Expr, Object, Value,
};

fn main() {
    let mut object = Object::new(Box::new(Generic::new(64)));
    let text = object.append_section("text", true);

    // A small header, aligned payload, and a LEB128-encoded pointer to
    // the end of the section.
    object
        .section_mut(text)
        .append_bytecode(Bytecode::new(Contents::data_raw(b"CORE".to_vec(), 1), 1));
    object.section_mut(text).append_bytecode(Bytecode::new(
        Contents::align(Expr::int(IntNum::new(8)), Some(Expr::int(IntNum::new(0x90))), None, false),
        2,
    ));

    let end = object.symtab_mut().get_or_new("end");
    let mut ptr = Value::from_sym(end, 0);
    ptr.finalize().unwrap();
    object
        .section_mut(text)
        .append_bytecode(Bytecode::new(Contents::leb128(vec![ptr], false), 3));

    let mut payload = Bytecode::new(Contents::data_raw(vec![0xAB], 1), 4);
    payload.set_multiple(Expr::int(IntNum::new(6)));
    object.section_mut(text).append_bytecode(payload);

    let end_loc = object.section(text).next_loc(text);
    object.symtab_mut().define_label(end, end_loc, 5).unwrap();

    // Settle lengths and offsets, then emit.
    let mut errwarns = Errwarns::new();
    object.optimize(&mut errwarns);
    for err in errwarns.errors() {
        eprintln!("error: {err}");
    }
    for warn in errwarns.warnings() {
        eprintln!("{warn}");
    }
    if errwarns.has_errors() {
        std::process::exit(1);
    }

    let mut out = BasicOutput::new(&object);
    let mut emit_errs = Errwarns::new();
    output_section(&object, text, &mut out, &mut emit_errs).expect("sink failed");

    println!("section 'text', {} bytes:", object.section(text).length());
    for (i, chunk) in out.bytes().chunks(8).enumerate() {
        print!("  {:04x}:", i * 8);
        for b in chunk {
            print!(" {b:02x}");
        }
        println!();
    }

    println!("symbols:");
    for (id, sym) in object.symtab().iter() {
        if let Some(off) = object.symbol_offset(id) {
            println!("  {:<8} = 0x{off:04x}", sym.name());
        }
    }
}
