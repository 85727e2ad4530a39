use std::cell::Cell;
use std::rc::Rc;

use myfiber::{Fiber, Runtime};
use tracing_subscriber::EnvFilter;

extern "C" fn all_done() {
    println!("Fiber A finished, exiting");
    std::process::exit(0);
}

fn main() -> myfiber::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let rt = Rc::new(Runtime::builder().exit_handler(all_done).build()?);
    let var = Rc::new(Cell::new(0));
    let peers: Rc<Cell<Option<(Fiber, Fiber)>>> = Rc::new(Cell::new(None));

    // A counts up from 0 and gives up its private copy once it reaches 2
    let a = rt.spawn({
        let (rt, var, peers) = (rt.clone(), var.clone(), peers.clone());
        move || {
            let Some((me, b)) = peers.get() else { return };
            unsafe { rt.bind_value(me, var.as_ptr()) };
            var.set(0);

            while var.get() < 5 {
                println!("Fiber A: var = {}", var.get());
                var.set(var.get() + 1);
                if var.get() == 2 {
                    unsafe { rt.release(me, var.as_ptr()) };
                }
                unsafe { rt.yield_to(b) };
            }
        }
    })?;

    // B counts up from -10 in steps of 2, forever
    let b = rt.spawn({
        let (rt, var, peers) = (rt.clone(), var.clone(), peers.clone());
        move || {
            let Some((a, me)) = peers.get() else { return };
            unsafe { rt.bind_value(me, var.as_ptr()) };
            var.set(-10);

            loop {
                println!("Fiber B: var = {}", var.get());
                var.set(var.get() + 2);
                unsafe { rt.yield_to(a) };
            }
        }
    })?;

    peers.set(Some((a, b)));
    unsafe { rt.switch(None, a) };

    Ok(())
}
