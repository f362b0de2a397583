use unwind::{DynamicSymbols, Status};

fn main() {
    env_logger::init();
    sub1();
}

#[inline(never)]
fn sub1() {
    sub2();
}

#[inline(never)]
fn sub2() {
    sub3();
}

#[inline(never)]
fn sub3() {
    let symbols = DynamicSymbols::new();
    let session = match unwind::unwind(64) {
        Ok(session) => session,
        Err(err) => {
            eprintln!("cannot unwind: {}", err);
            return;
        }
    };
    let mut frames = session.symbolicate(&symbols);
    for frame in &mut frames {
        match frame.name {
            Some(name) => println!("{:#x}: ({}+{:#x})", frame.address, name, frame.offset),
            None => println!("{:#x}: -- no symbol", frame.address),
        }
    }
    match frames.status() {
        Status::Errored(err) => eprintln!("unwind stopped: {}", err),
        Status::LimitReached => eprintln!("more frames left"),
        _ => {}
    }
}
