// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use apartment_rt::{Apartment, AsyncContext, Future, main};

#[main]
fn main(apartment: Apartment) {
    println!("Hello, world!");

    Future::post(apartment, AsyncContext::empty(), || {
        println!("Hello again!");
        Ok(())
    })
    .wait()
    .unwrap();
}
