// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use apartment_rt::{Apartment, AsyncContext, Flow, main};

#[main]
fn main(apartment: Apartment) {
    let flow = Flow::new();
    flow.set_default_apartment(apartment);

    flow.add_task("a", None, AsyncContext::empty(), || {
        println!("a: no dependencies");
        Ok(())
    })
    .unwrap();

    flow.add_task("b: a", None, AsyncContext::empty(), || {
        println!("b: waited for a");
        Ok(())
    })
    .unwrap();

    flow.add_task("c: a", None, AsyncContext::empty(), || {
        println!("c: waited for a");
        Ok(())
    })
    .unwrap();

    flow.add_task("d: b, c", None, AsyncContext::empty(), || {
        println!("d: waited for both b and c");
        Ok(())
    })
    .unwrap();

    flow.start().unwrap();
    flow.wait().unwrap();

    println!("flow completed, failed task: {:?}", flow.get_failed_task_name());
}
